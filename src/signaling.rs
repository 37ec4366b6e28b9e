use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames exchanged with the room relay. The relay broadcasts `chat` and the
/// membership events to every client in the room and unicasts `signal` frames
/// to the named `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Join {
        room: String,
        username: String,
    },
    Chat {
        room: String,
        username: String,
        content: String,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    /// Full roster snapshot, comma-joined names. May be re-sent at any time.
    UserList {
        content: String,
    },
    Signal {
        target: String,
        username: String,
        /// Nested negotiation payload, carried as a JSON string on the wire.
        signal: String,
    },
}

/// The negotiation payload nested inside a `signal` frame. Each variant keys
/// its body by its own type, so the wire form is `{"type":"offer","offer":…}`
/// and so on. Descriptions and candidates are opaque to the signaling layer;
/// only the media engine reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { offer: Value },
    Answer { answer: Value },
    Candidate { candidate: Value },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}
