//! Transport capability interface
//!
//! Session managers never touch the real-time engine directly. They drive a
//! [`PeerTransport`] created by a [`TransportFactory`] and consume the
//! [`TransportEvent`]s it reports on a channel. The production implementation
//! lives in [`webrtc`]; tests plug in scripted transports.

pub mod webrtc;

pub use self::webrtc::{WebRtcMediaSource, WebRtcTransport, WebRtcTransportFactory};

use crate::config::IceConfig;
use crate::error::Result;
use crate::quality::{CaptureConstraints, EncodingParameters};
use crate::stats::TransportStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// ICE candidate for a transport connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the transport will not carry media again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Opaque, engine-owned media track
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Engine object backing the track, downcast by the transport that owns it
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            kind,
            handle,
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Track produced locally and attached to outbound sessions
pub type LocalTrack = MediaTrack;

/// Track received from the remote side
pub type RemoteTrack = MediaTrack;

/// Asynchronous notifications from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate was gathered and must be signaled to the remote side
    IceCandidate(IceCandidate),
    StateChange(TransportState),
    Track(RemoteTrack),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Parameters the outbound senders currently run with, if any were set
    async fn encoding_parameters(&self) -> Option<EncodingParameters>;

    async fn set_encoding_parameters(&self, parameters: EncodingParameters) -> Result<()>;

    /// Cumulative counters since the transport was created
    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports together with the channel carrying their events
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ice: &IceConfig) -> Result<(Arc<dyn PeerTransport>, TransportEvents)>;
}

/// Local capture bound by the broadcaster
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    async fn apply_constraints(&self, constraints: CaptureConstraints) -> Result<()>;
}

/// Output the viewer hands received tracks to
pub trait MediaSink: Send + Sync {
    fn on_track(&self, track: RemoteTrack);
}

/// Remote candidates waiting for the remote description.
///
/// Candidates pushed before [`CandidateBuffer::mark_remote_description_set`] are
/// queued and handed back exactly once, in arrival order, by that call. Once the
/// remote description is set, pushes pass straight through.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate back when it can be applied immediately
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    /// Flip the flag and take the queue. Later calls return nothing.
    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.queued)
    }

    #[must_use]
    pub const fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_queue_until_remote_description() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.push(IceCandidate::new("c1")).is_none());
        assert!(buffer.push(IceCandidate::new("c2")).is_none());
        assert!(buffer.push(IceCandidate::new("c3")).is_none());
        assert_eq!(buffer.len(), 3);

        let drained = buffer.mark_remote_description_set();
        let order: Vec<&str> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(order, ["c1", "c2", "c3"]);
        assert!(buffer.has_remote_description());

        // Drained exactly once
        assert!(buffer.mark_remote_description_set().is_empty());

        let passed = buffer.push(IceCandidate::new("c4")).unwrap();
        assert_eq!(passed.candidate, "c4");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransportState::Failed.is_terminal());
        assert!(TransportState::Disconnected.is_terminal());
        assert!(TransportState::Closed.is_terminal());
        assert!(!TransportState::Connecting.is_terminal());
        assert!(!TransportState::Connected.is_terminal());
    }

    #[test]
    fn test_description_wire_shape() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json["sdpType"], "answer");
        assert_eq!(json["sdp"], "v=0");

        let candidate: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMlineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        // Missing optional fields are accepted
        let bare: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(bare, IceCandidate::new("c"));
    }
}
