//! Signaling protocol
//!
//! Messages exchanged between the broadcaster and its viewers over the shared
//! per-stream relay channel. Every participant of a stream sees every message,
//! so each side filters with [`SignalingMessage::is_relevant_to`] before
//! dispatching on the payload type.

pub mod relay;

pub use relay::{LocalRelay, SignalingRelay, Subscription, SubscriptionId};

use crate::quality::QualityTier;
use crate::transport::{IceCandidate, SessionDescription};
use crate::types::{ConnectionId, PeerId, StreamId};
use serde::{Deserialize, Serialize};

/// Typed payload; the tag doubles as the message type on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingPayload {
    /// A viewer asks the broadcaster for a session
    ViewerJoin {
        connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<QualityTier>,
    },
    Offer {
        connection_id: ConnectionId,
        description: SessionDescription,
    },
    Answer {
        connection_id: ConnectionId,
        description: SessionDescription,
    },
    IceCandidate {
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    /// A viewer asks for its session to be re-encoded at another tier
    QualityChange { tier: QualityTier },
}

impl SignalingPayload {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::ViewerJoin { .. } => "viewer-join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::QualityChange { .. } => "quality-change",
        }
    }

    /// Whether the message is meant for every participant rather than one target
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self, Self::ViewerJoin { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub stream_id: StreamId,
    pub sender_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PeerId>,
    pub payload: SignalingPayload,
}

impl SignalingMessage {
    pub fn new(
        stream_id: StreamId,
        sender_id: PeerId,
        target_id: Option<PeerId>,
        payload: SignalingPayload,
    ) -> Self {
        Self {
            stream_id,
            sender_id,
            target_id,
            payload,
        }
    }

    pub fn viewer_join(
        stream_id: StreamId,
        viewer_id: PeerId,
        connection_id: ConnectionId,
        tier: Option<QualityTier>,
    ) -> Self {
        Self::new(
            stream_id,
            viewer_id,
            None,
            SignalingPayload::ViewerJoin { connection_id, tier },
        )
    }

    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }

    /// Filter applied to everything read from the shared channel: never our own
    /// messages, and only broadcasts or messages targeted at `local_id`.
    #[must_use]
    pub fn is_relevant_to(&self, local_id: &PeerId) -> bool {
        if &self.sender_id == local_id {
            return false;
        }
        match &self.target_id {
            Some(target) => target == local_id,
            None => self.payload.is_broadcast(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
