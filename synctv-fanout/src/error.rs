use thiserror::Error;

use crate::types::ViewerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation with viewer {viewer_id} failed: {reason}")]
    Negotiation { viewer_id: ViewerId, reason: String },

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Unknown quality tier: {0}")]
    UnknownTier(String),

    #[error("Bandwidth probe failed: {0}")]
    Probe(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Session manager already started")]
    AlreadyStarted,

    #[error("Session manager was stopped")]
    Stopped,

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Probe(err.to_string())
    }
}

impl Error {
    /// Whether the failure only concerns a single session and can be absorbed
    #[must_use]
    pub const fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Negotiation { .. } | Self::InvalidSdp(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
