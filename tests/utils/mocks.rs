use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use voicemesh::error::{Error, Result};
use voicemesh::media::{LinkEvent, LinkFactory, MediaLink, NegotiationPhase};
use voicemesh::signaling::SignalPayload;

// ============================================================================
// Simulated media engine
// ============================================================================

struct LinkState {
    phase: NegotiationPhase,
    remote_description: bool,
    candidates: Vec<Value>,
    closed: bool,
}

/// A media link that follows webrtc signaling-state rules without any
/// networking: offers move it to `HaveLocalOffer`, a committed answer settles
/// it back to `Stable`, and candidates require a remote description first.
pub struct SimulatedLink {
    peer: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkState>,
}

impl SimulatedLink {
    fn new(peer: &str, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer: peer.to_string(),
            events,
            state: Mutex::new(LinkState {
                phase: NegotiationPhase::Stable,
                remote_description: false,
                candidates: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Simulate the engine discovering a local candidate: it goes straight
    /// out through the link-event hook, exactly like the production factory.
    pub fn discover_candidate(&self, candidate: Value) {
        let _ = self.events.send(LinkEvent::signal(
            self.peer.clone(),
            SignalPayload::Candidate { candidate },
        ));
    }

    pub fn candidates_applied(&self) -> Vec<Value> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl MediaLink for SimulatedLink {
    async fn create_offer(&self) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state.phase = NegotiationPhase::HaveLocalOffer;
        Ok(json!({"type": "offer", "sdp": format!("offer-toward-{}", self.peer)}))
    }

    async fn accept_offer(&self, _offer: Value) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state.remote_description = true;
        state.phase = NegotiationPhase::Stable;
        Ok(json!({"type": "answer", "sdp": format!("answer-toward-{}", self.peer)}))
    }

    async fn accept_answer(&self, _answer: Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.remote_description = true;
        state.phase = NegotiationPhase::Stable;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.remote_description {
            return Err(Error::Media("remote description not set".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn negotiation_phase(&self) -> NegotiationPhase {
        let state = self.state.lock().unwrap();
        if state.closed {
            NegotiationPhase::Closed
        } else {
            state.phase
        }
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
pub struct SimulatedFactory {
    opened: Mutex<Vec<String>>,
    links: Mutex<HashMap<String, Arc<SimulatedLink>>>,
}

impl SimulatedFactory {
    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn link(&self, peer: &str) -> Arc<SimulatedLink> {
        self.links
            .lock()
            .unwrap()
            .get(peer)
            .unwrap_or_else(|| panic!("no simulated link for {peer}"))
            .clone()
    }
}

#[async_trait]
impl LinkFactory for SimulatedFactory {
    async fn open_link(
        &self,
        peer: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>> {
        self.opened.lock().unwrap().push(peer.to_string());
        let link = Arc::new(SimulatedLink::new(peer, events));
        self.links
            .lock()
            .unwrap()
            .insert(peer.to_string(), link.clone());
        Ok(link)
    }
}
