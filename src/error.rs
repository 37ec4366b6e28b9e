use thiserror::Error;
use webrtc::Error as WebRtcError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] WebRtcError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("audio error: {0}")]
    Audio(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
