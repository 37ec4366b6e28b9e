use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioPlayback;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::media::{LinkEvent, LinkEventKind, LinkFactory, MediaLink, NegotiationPhase};
use crate::signaling::SignalPayload;

/// Media engine shared by every link of a session: one API instance, one ICE
/// configuration, and one local audio track fanned out to every connection.
pub struct RtcLinkFactory {
    api: API,
    ice_servers: Vec<String>,
    audio_track: Arc<TrackLocalStaticSample>,
}

impl RtcLinkFactory {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "voicemesh".to_owned(),
        ));

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
            audio_track,
        })
    }

    /// The capture side writes into this track; every link carries it.
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn open_link(
        &self,
        peer: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        pc.add_track(Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let playback: Arc<Mutex<Option<AudioPlayback>>> = Arc::new(Mutex::new(None));

        let peer_name = peer.to_string();
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let peer = peer_name.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to serialize candidate");
                        return;
                    }
                };
                let value = match serde_json::to_value(&init) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to encode candidate");
                        return;
                    }
                };
                debug!(peer = %peer, "forwarding discovered candidate");
                let _ = events.send(LinkEvent::signal(
                    peer,
                    SignalPayload::Candidate { candidate: value },
                ));
            })
        }));

        let peer_name = peer.to_string();
        let track_playback = playback.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let peer = peer_name.clone();
                let playback = track_playback.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    debug!(peer = %peer, "remote audio track arrived");
                    let sink = AudioPlayback::start(&peer, track);
                    // A duplicate track event replaces, and thereby stops,
                    // the previous sink for this peer.
                    if let Ok(mut guard) = playback.lock() {
                        *guard = Some(sink);
                    }
                })
            },
        ));

        let peer_name = peer.to_string();
        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer_name.clone();
            let events = state_events.clone();
            Box::pin(async move {
                debug!(peer = %peer, state = %state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(LinkEvent {
                            peer,
                            kind: LinkEventKind::Connected,
                        });
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(LinkEvent {
                            peer,
                            kind: LinkEventKind::Failed,
                        });
                    }
                    _ => {}
                }
            })
        }));

        Ok(Arc::new(RtcLink {
            peer: peer.to_string(),
            pc,
            playback,
        }))
    }
}

/// One webrtc peer connection plus the playback sink its remote track feeds.
pub struct RtcLink {
    peer: String,
    pc: Arc<RTCPeerConnection>,
    playback: Arc<Mutex<Option<AudioPlayback>>>,
}

#[async_trait]
impl MediaLink for RtcLink {
    async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(&offer)?)
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(&answer)?)
    }

    async fn accept_answer(&self, answer: Value) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn negotiation_phase(&self) -> NegotiationPhase {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationPhase::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationPhase::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationPhase::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => {
                NegotiationPhase::Stable
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.peer, error = %e, "error closing peer connection");
        }
        if let Ok(mut guard) = self.playback.lock() {
            *guard = None;
        }
    }
}
