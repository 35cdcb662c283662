//! Common identifiers and the connection state shared by both session managers

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a participant on the signaling channel (broadcaster or viewer)
    PeerId
);

string_id!(
    /// Identifier of one logical broadcast; also the signaling channel key
    StreamId
);

string_id!(
    /// Identifier of one `ViewerConnection` incarnation.
    ///
    /// A viewer mints a new one for every connection attempt and both sides echo
    /// it in negotiation messages, so stale or duplicated deliveries can be told
    /// apart from the live negotiation.
    ConnectionId
);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

/// Viewers are addressed by their signaling identity
pub type ViewerId = PeerId;

/// One logical broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    pub stream_id: StreamId,
    pub broadcaster_id: PeerId,
}

impl StreamSession {
    pub fn new(stream_id: impl Into<StreamId>, broadcaster_id: impl Into<PeerId>) -> Self {
        Self {
            stream_id: stream_id.into(),
            broadcaster_id: broadcaster_id.into(),
        }
    }
}

/// Externally observable state of a session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
