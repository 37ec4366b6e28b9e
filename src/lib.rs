//! Full-mesh voice chat over a lightweight signaling relay.
//!
//! A [`session::RoomSession`] joins a named room through a WebSocket relay,
//! negotiates one direct audio link per remote participant, and keeps the
//! mesh in step with room membership. The relay carries signaling only; audio
//! flows peer to peer through the webrtc engine.

pub mod audio;
pub mod config;
pub mod error;
pub mod links;
pub mod media;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use session::{RoomSession, RoomUpdate, SessionCommand, SessionHandle};
