//! `SyncTV` fan-out broadcast
//!
//! This crate distributes one live source to many viewers. The broadcaster
//! keeps an independent outbound session per viewer and tunes each session's
//! encoding parameters, while every viewer keeps a single inbound connection
//! alive with exponential reconnection.
//!
//! ## Architecture
//!
//! - **`Broadcaster`**: Owns one `PeerSession` per viewer and adapts the default tier
//! - **`Viewer`**: Owns one connection to the broadcaster and requests tier changes
//! - **`SignalingRelay`**: Ordered pub/sub channel keyed by stream id
//! - **`PeerTransport`**: Capability interface over the real-time transport engine
//! - **`QualityTier`**: Ordered quality catalog (ultra, high, medium, low, mobile)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_fanout::{Broadcaster, FanoutConfig, FixedNetwork, LocalRelay, StreamSession, WebRtcTransportFactory};
//!
//! let config = Arc::new(FanoutConfig::load(None)?);
//! let relay = Arc::new(LocalRelay::new());
//! let factory = Arc::new(WebRtcTransportFactory::new()?);
//! let network = Arc::new(FixedNetwork::default());
//!
//! let session = StreamSession::new("stream-1", "broadcaster-1");
//! let broadcaster = Broadcaster::new(session, config, relay, factory, network);
//! broadcaster.start(media_source).await?;
//! ```

pub mod bandwidth;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod logging;
mod peer;
pub mod quality;
pub mod sdp;
pub mod signaling;
pub mod stats;
pub mod transport;
pub mod types;
pub mod viewer;

pub use bandwidth::{
    estimate_bandwidth, FixedNetwork, HttpBandwidthProbe, NetworkInfo, NetworkObserver, NetworkSampler, ProbingNetwork,
};
pub use broadcaster::Broadcaster;
pub use config::FanoutConfig;
pub use error::{Error, Result};
pub use quality::{select_quality_tier, QualityPreset, QualityTier};
pub use signaling::{LocalRelay, SignalingMessage, SignalingPayload, SignalingRelay};
pub use stats::StreamStats;
pub use transport::{MediaSink, MediaSource, PeerTransport, TransportFactory, WebRtcMediaSource, WebRtcTransportFactory};
pub use types::{ConnectionId, ConnectionState, PeerId, StreamId, StreamSession, ViewerId};
pub use viewer::{ReconnectPolicy, Viewer};
