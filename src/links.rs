use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::media::{LinkEvent, LinkFactory, MediaLink, NegotiationPhase};
use crate::signaling::SignalPayload;

/// Which side started the negotiation. Fixed at link creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

/// Lifecycle of a link as the manager sees it. `Connected` is reported by the
/// media engine; everything else tracks which description we last committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    New,
    OfferSent,
    AnswerSent,
    Connected,
}

struct PeerLink {
    media: Arc<dyn MediaLink>,
    role: LinkRole,
    phase: LinkPhase,
    opened_at: Instant,
}

/// Owns the full-mesh link store: one negotiated media link per remote
/// participant, keyed by name. All mutation happens from the session's
/// dispatch turns, one event at a time.
pub struct PeerLinkManager {
    links: HashMap<String, PeerLink>,
    factory: Arc<dyn LinkFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl PeerLinkManager {
    pub fn new(factory: Arc<dyn LinkFactory>, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            links: HashMap::new(),
            factory,
            events,
        }
    }

    /// Open a link to `target`. A second create for the same target is a
    /// no-op, whatever its initiator flag: at most one link per participant.
    ///
    /// As initiator the offer is produced within the same dispatch turn and
    /// emitted through the link-event hook. Offer failure leaves the link
    /// stored but unnegotiated; the timeout sweep reclaims it eventually.
    pub async fn create_link(&mut self, target: &str, initiator: bool) -> Result<()> {
        if self.links.contains_key(target) {
            debug!(peer = %target, "link already exists, ignoring create");
            return Ok(());
        }

        let media = self.factory.open_link(target, self.events.clone()).await?;
        let role = if initiator {
            LinkRole::Initiator
        } else {
            LinkRole::Responder
        };
        self.links.insert(
            target.to_string(),
            PeerLink {
                media: media.clone(),
                role,
                phase: LinkPhase::New,
                opened_at: Instant::now(),
            },
        );
        debug!(peer = %target, ?role, "opened peer link");

        if initiator {
            match media.create_offer().await {
                Ok(offer) => {
                    if let Some(link) = self.links.get_mut(target) {
                        link.phase = LinkPhase::OfferSent;
                    }
                    let _ = self
                        .events
                        .send(LinkEvent::signal(target, SignalPayload::Offer { offer }));
                }
                Err(e) => warn!(peer = %target, error = %e, "offer creation failed"),
            }
        }
        Ok(())
    }

    /// Entry point for a relayed `signal` frame from `sender`. Every error is
    /// absorbed here: one malformed or ill-timed signal must not disturb any
    /// other link or later messages.
    pub async fn handle_signal(&mut self, sender: &str, raw: &str) {
        if let Err(e) = self.dispatch_signal(sender, raw).await {
            warn!(peer = %sender, error = %e, "signal handling failed");
        }
    }

    async fn dispatch_signal(&mut self, sender: &str, raw: &str) -> Result<()> {
        let payload: SignalPayload = serde_json::from_str(raw)?;
        debug!(peer = %sender, kind = payload.kind(), "handling signal");

        match payload {
            SignalPayload::Offer { offer } => {
                if !self.links.contains_key(sender) {
                    self.create_link(sender, false).await?;
                }
                let Some(link) = self.links.get_mut(sender) else {
                    return Ok(());
                };
                // Glare guard: a local offer is outstanding, first offer wins.
                // The phase is read here, after any creation await, so a
                // signal landing mid-negotiation still sees a settled value.
                if link.media.negotiation_phase() != NegotiationPhase::Stable {
                    debug!(peer = %sender, "ignoring offer in non-stable state");
                    return Ok(());
                }
                let answer = link.media.accept_offer(offer).await?;
                link.phase = LinkPhase::AnswerSent;
                let _ = self
                    .events
                    .send(LinkEvent::signal(sender, SignalPayload::Answer { answer }));
            }
            SignalPayload::Answer { answer } => {
                if let Some(link) = self.links.get_mut(sender) {
                    if link.media.negotiation_phase() == NegotiationPhase::Stable {
                        debug!(peer = %sender, "ignoring stale answer");
                    } else {
                        link.media.accept_answer(answer).await?;
                    }
                }
            }
            SignalPayload::Candidate { candidate } => {
                if let Some(link) = self.links.get(sender) {
                    // Per-candidate isolation: an early or bad candidate must
                    // never abort the link.
                    if let Err(e) = link.media.add_remote_candidate(candidate).await {
                        warn!(peer = %sender, error = %e, "failed to add candidate");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn mark_connected(&mut self, peer: &str) {
        if let Some(link) = self.links.get_mut(peer) {
            link.phase = LinkPhase::Connected;
        }
    }

    /// Close and remove `target`'s link. No-op if absent.
    pub async fn close_link(&mut self, target: &str) {
        if let Some(link) = self.links.remove(target) {
            debug!(peer = %target, "closing peer link");
            link.media.close().await;
        }
    }

    pub async fn close_all(&mut self) {
        let targets: Vec<String> = self.links.keys().cloned().collect();
        for target in targets {
            self.close_link(&target).await;
        }
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    pub fn linked_peers(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn phase(&self, peer: &str) -> Option<LinkPhase> {
        self.links.get(peer).map(|link| link.phase)
    }

    pub fn role(&self, peer: &str) -> Option<LinkRole> {
        self.links.get(peer).map(|link| link.role)
    }

    /// Links that never reached `Connected` within `timeout`, oldest first.
    /// The session sweeps these per the timeout-and-retry policy.
    pub fn stale_links(&self, timeout: Duration) -> Vec<String> {
        let mut stale: Vec<(&String, &PeerLink)> = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.phase != LinkPhase::Connected && link.opened_at.elapsed() >= timeout
            })
            .collect();
        stale.sort_by_key(|(_, link)| link.opened_at);
        stale.into_iter().map(|(peer, _)| peer.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    use crate::error::Error;
    use crate::media::LinkEventKind;

    struct MockLinkState {
        phase: NegotiationPhase,
        remote_description: bool,
        candidates: Vec<Value>,
        answers_applied: usize,
        close_calls: usize,
    }

    struct MockLink {
        state: Mutex<MockLinkState>,
    }

    impl MockLink {
        fn new() -> Self {
            Self {
                state: Mutex::new(MockLinkState {
                    phase: NegotiationPhase::Stable,
                    remote_description: false,
                    candidates: Vec::new(),
                    answers_applied: 0,
                    close_calls: 0,
                }),
            }
        }

        fn candidates_applied(&self) -> usize {
            self.state.lock().unwrap().candidates.len()
        }

        fn answers_applied(&self) -> usize {
            self.state.lock().unwrap().answers_applied
        }

        fn close_calls(&self) -> usize {
            self.state.lock().unwrap().close_calls
        }
    }

    #[async_trait]
    impl MediaLink for MockLink {
        async fn create_offer(&self) -> crate::error::Result<Value> {
            let mut state = self.state.lock().unwrap();
            state.phase = NegotiationPhase::HaveLocalOffer;
            Ok(json!({"type": "offer", "sdp": "mock-offer"}))
        }

        async fn accept_offer(&self, _offer: Value) -> crate::error::Result<Value> {
            let mut state = self.state.lock().unwrap();
            state.remote_description = true;
            state.phase = NegotiationPhase::Stable;
            Ok(json!({"type": "answer", "sdp": "mock-answer"}))
        }

        async fn accept_answer(&self, _answer: Value) -> crate::error::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.remote_description = true;
            state.phase = NegotiationPhase::Stable;
            state.answers_applied += 1;
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: Value) -> crate::error::Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.remote_description {
                return Err(Error::Media("remote description not set".into()));
            }
            state.candidates.push(candidate);
            Ok(())
        }

        fn negotiation_phase(&self) -> NegotiationPhase {
            self.state.lock().unwrap().phase
        }

        async fn close(&self) {
            let mut state = self.state.lock().unwrap();
            state.phase = NegotiationPhase::Closed;
            state.close_calls += 1;
        }
    }

    #[derive(Default)]
    struct MockFactory {
        opened: Mutex<Vec<String>>,
        links: Mutex<HashMap<String, Arc<MockLink>>>,
    }

    impl MockFactory {
        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn link(&self, peer: &str) -> Arc<MockLink> {
            self.links.lock().unwrap().get(peer).unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkFactory for MockFactory {
        async fn open_link(
            &self,
            peer: &str,
            _events: mpsc::UnboundedSender<LinkEvent>,
        ) -> crate::error::Result<Arc<dyn MediaLink>> {
            self.opened.lock().unwrap().push(peer.to_string());
            let link = Arc::new(MockLink::new());
            self.links
                .lock()
                .unwrap()
                .insert(peer.to_string(), link.clone());
            Ok(link)
        }
    }

    fn manager() -> (
        PeerLinkManager,
        Arc<MockFactory>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let factory = Arc::new(MockFactory::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerLinkManager::new(factory.clone(), tx), factory, rx)
    }

    fn drain_signals(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<(String, SignalPayload)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LinkEventKind::SignalReady(payload) = event.kind {
                out.push((event.peer, payload));
            }
        }
        out
    }

    fn wire(payload: &SignalPayload) -> String {
        serde_json::to_string(payload).unwrap()
    }

    fn offer_wire() -> String {
        wire(&SignalPayload::Offer {
            offer: json!({"type": "offer", "sdp": "remote-offer"}),
        })
    }

    #[tokio::test]
    async fn create_link_is_idempotent_across_initiator_flags() {
        let (mut links, factory, mut rx) = manager();

        links.create_link("bob", true).await.unwrap();
        links.create_link("bob", true).await.unwrap();
        links.create_link("bob", false).await.unwrap();

        assert_eq!(factory.open_count(), 1);
        assert_eq!(links.len(), 1);
        assert_eq!(links.role("bob"), Some(LinkRole::Initiator));

        let signals = drain_signals(&mut rx);
        assert_eq!(signals.len(), 1, "redundant creates must not re-offer");
        assert_eq!(signals[0].0, "bob");
        assert_eq!(signals[0].1.kind(), "offer");
    }

    #[tokio::test]
    async fn responder_create_emits_no_offer() {
        let (mut links, factory, mut rx) = manager();

        links.create_link("bob", false).await.unwrap();

        assert_eq!(factory.open_count(), 1);
        assert_eq!(links.phase("bob"), Some(LinkPhase::New));
        assert!(drain_signals(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn close_link_and_close_all_are_idempotent() {
        let (mut links, factory, _rx) = manager();

        links.close_link("ghost").await;

        links.create_link("bob", true).await.unwrap();
        let bob = factory.link("bob");
        links.close_link("bob").await;
        links.close_link("bob").await;
        assert_eq!(bob.close_calls(), 1);
        assert!(links.is_empty());

        links.create_link("carol", true).await.unwrap();
        links.create_link("dave", false).await.unwrap();
        links.close_all().await;
        links.close_all().await;
        assert!(links.is_empty());
        assert_eq!(factory.link("carol").close_calls(), 1);
        assert_eq!(factory.link("dave").close_calls(), 1);
    }

    #[tokio::test]
    async fn incoming_offer_creates_responder_link_and_answers() {
        let (mut links, _factory, mut rx) = manager();

        links.handle_signal("alice", &offer_wire()).await;

        assert_eq!(links.role("alice"), Some(LinkRole::Responder));
        assert_eq!(links.phase("alice"), Some(LinkPhase::AnswerSent));

        let signals = drain_signals(&mut rx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].0, "alice");
        assert_eq!(signals[0].1.kind(), "answer");
    }

    #[tokio::test]
    async fn glare_reciprocal_offer_is_ignored() {
        let (mut links, factory, mut rx) = manager();

        // We initiated toward bob: a local offer is outstanding.
        links.create_link("bob", true).await.unwrap();
        drain_signals(&mut rx);

        // Bob initiated toward us at the same time; his offer must be dropped.
        links.handle_signal("bob", &offer_wire()).await;

        assert_eq!(links.len(), 1);
        assert_eq!(factory.open_count(), 1);
        assert_eq!(links.phase("bob"), Some(LinkPhase::OfferSent));
        assert!(
            drain_signals(&mut rx).is_empty(),
            "no answer for an offer dropped by the glare guard"
        );
    }

    #[tokio::test]
    async fn first_offer_wins_then_reciprocal_create_degrades_to_noop() {
        let (mut links, factory, mut rx) = manager();

        // Alice's offer lands before our membership event triggers a create.
        links.handle_signal("alice", &offer_wire()).await;
        drain_signals(&mut rx);

        links.create_link("alice", true).await.unwrap();

        assert_eq!(factory.open_count(), 1);
        assert_eq!(links.role("alice"), Some(LinkRole::Responder));
        assert!(drain_signals(&mut rx).is_empty(), "no reciprocal offer");
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let (mut links, factory, mut rx) = manager();

        links.create_link("bob", true).await.unwrap();
        drain_signals(&mut rx);
        let answer = wire(&SignalPayload::Answer {
            answer: json!({"type": "answer", "sdp": "remote-answer"}),
        });

        links.handle_signal("bob", &answer).await;
        links.handle_signal("bob", &answer).await;

        assert_eq!(factory.link("bob").answers_applied(), 1);
    }

    #[tokio::test]
    async fn answer_without_link_is_ignored() {
        let (mut links, factory, _rx) = manager();

        let answer = wire(&SignalPayload::Answer {
            answer: json!({"type": "answer", "sdp": "remote-answer"}),
        });
        links.handle_signal("stranger", &answer).await;

        assert!(links.is_empty());
        assert_eq!(factory.open_count(), 0);
    }

    #[tokio::test]
    async fn early_candidate_is_absorbed_without_corrupting_the_link() {
        let (mut links, factory, _rx) = manager();

        let candidate = wire(&SignalPayload::Candidate {
            candidate: json!({"candidate": "candidate:0 1 udp 1 198.51.100.7 9 typ host"}),
        });

        // No link at all: dropped silently.
        links.handle_signal("bob", &candidate).await;
        assert!(links.is_empty());

        // Link exists but no remote description yet: the failure stays
        // per-candidate.
        links.create_link("bob", true).await.unwrap();
        links.handle_signal("bob", &candidate).await;
        assert!(links.contains("bob"));
        assert_eq!(factory.link("bob").candidates_applied(), 0);

        // After the answer lands, candidates apply normally.
        let answer = wire(&SignalPayload::Answer {
            answer: json!({"type": "answer", "sdp": "remote-answer"}),
        });
        links.handle_signal("bob", &answer).await;
        links.handle_signal("bob", &candidate).await;
        assert_eq!(factory.link("bob").candidates_applied(), 1);
    }

    #[tokio::test]
    async fn malformed_signal_does_not_poison_later_ones() {
        let (mut links, _factory, mut rx) = manager();

        links.handle_signal("alice", "definitely not json").await;
        links.handle_signal("alice", r#"{"type":"warp"}"#).await;
        assert!(links.is_empty());

        links.handle_signal("alice", &offer_wire()).await;
        assert!(links.contains("alice"));
        assert_eq!(drain_signals(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn stale_links_reports_unconnected_links_only() {
        let (mut links, _factory, _rx) = manager();

        links.create_link("bob", true).await.unwrap();
        links.create_link("carol", false).await.unwrap();

        let stale = links.stale_links(Duration::ZERO);
        assert_eq!(stale.len(), 2);

        links.mark_connected("bob");
        let stale = links.stale_links(Duration::ZERO);
        assert_eq!(stale, vec!["carol".to_string()]);

        assert!(links.stale_links(Duration::from_secs(3600)).is_empty());
    }
}
