use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::SignalPayload;

/// Signaling-side view of a media link's negotiation, mirroring the media
/// engine's signaling states. The glare guard keys off `Stable`: an offer is
/// only accepted while no local offer is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Events a media link pushes back to the session: outbound signaling payloads
/// (discovered candidates, and the offers/answers the manager emits through the
/// same hook) and connection-state transitions.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer: String,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// A negotiation payload ready to be relayed to `peer`.
    SignalReady(SignalPayload),
    Connected,
    Failed,
}

impl LinkEvent {
    pub fn signal(peer: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            peer: peer.into(),
            kind: LinkEventKind::SignalReady(payload),
        }
    }
}

/// One negotiated media connection to a single remote participant.
///
/// Descriptions and candidates cross this boundary as opaque JSON values; the
/// implementation owns their real types, along with the inbound audio sink for
/// the peer (released by `close`).
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Produce a local offer and commit it as the local description.
    async fn create_offer(&self) -> Result<Value>;

    /// Commit a remote offer, produce and commit a local answer, return it.
    async fn accept_offer(&self, offer: Value) -> Result<Value>;

    /// Commit a remote answer as the remote description.
    async fn accept_answer(&self, answer: Value) -> Result<()>;

    /// Apply one remote ICE candidate. Fails if the link is not ready for it;
    /// callers treat that as a per-candidate event, never fatal to the link.
    async fn add_remote_candidate(&self, candidate: Value) -> Result<()>;

    fn negotiation_phase(&self) -> NegotiationPhase;

    /// Close the link and release its media resources. Idempotent.
    async fn close(&self);
}

/// Opens media links. The production factory wraps the webrtc engine; tests
/// substitute simulated links to drive the state machine deterministically.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open_link(
        &self,
        peer: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>>;
}
