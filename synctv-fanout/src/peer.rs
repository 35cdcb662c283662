//! Per-viewer outbound session
//!
//! This module handles:
//! - The broadcaster-side state of one viewer connection
//! - Candidate queueing until the viewer's answer is applied
//! - Forwarding transport events into the owning manager's event loop

use crate::quality::{build_encoding_parameters, EncodingOverride, QualityTier};
use crate::stats::{MediaDirection, StatsSample, StreamStats, TransportStats};
use crate::transport::{CandidateBuffer, PeerTransport, TransportEvent, TransportEvents};
use crate::types::{ConnectionId, ViewerId};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifies which session incarnation an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub viewer_id: ViewerId,
    pub connection_id: ConnectionId,
}

/// Relay every event of a transport into a manager's loop, tagged with `tag`.
///
/// The returned task is aborted when the session is torn down, so events of a
/// closed transport never reach the loop.
pub(crate) fn forward_events<T>(
    mut events: TransportEvents,
    tag: T,
    sink: mpsc::UnboundedSender<(T, TransportEvent)>,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sink.send((tag.clone(), event)).is_err() {
                break;
            }
        }
    })
}

/// Broadcaster-owned state for one viewer
pub struct PeerSession {
    pub key: SessionKey,
    pub transport: Arc<dyn PeerTransport>,
    /// Tier the session is currently encoded at
    pub tier: QualityTier,
    candidates: CandidateBuffer,
    last_sample: Option<StatsSample>,
    forwarder: JoinHandle<()>,
}

impl PeerSession {
    pub(crate) fn new(
        key: SessionKey,
        transport: Arc<dyn PeerTransport>,
        tier: QualityTier,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            key,
            transport,
            tier,
            candidates: CandidateBuffer::new(),
            last_sample: None,
            forwarder,
        }
    }

    #[must_use]
    pub fn viewer_id(&self) -> &ViewerId {
        &self.key.viewer_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.key.connection_id
    }

    #[must_use]
    pub const fn has_remote_description(&self) -> bool {
        self.candidates.has_remote_description()
    }

    /// Apply encoding parameters for `tier`, capped at `max_bitrate_kbps` (0 = unlimited).
    /// Senders already running with the same parameters are left alone.
    pub async fn apply_tier(&mut self, tier: QualityTier, max_bitrate_kbps: u32) -> Result<()> {
        let preset = tier.preset();
        let cap = EncodingOverride::bitrate_cap(preset, max_bitrate_kbps);
        let parameters = build_encoding_parameters(preset, cap.as_ref());

        if self.transport.encoding_parameters().await == Some(parameters) {
            debug!(viewer_id = %self.key.viewer_id, tier = %tier, "Encoding parameters unchanged");
            self.tier = tier;
            return Ok(());
        }
        self.transport.set_encoding_parameters(parameters).await?;
        self.tier = tier;

        debug!(
            viewer_id = %self.key.viewer_id,
            tier = %tier,
            max_bitrate = parameters.max_bitrate,
            max_framerate = parameters.max_framerate,
            "Encoding parameters applied"
        );
        Ok(())
    }

    /// Queue or apply a remote candidate
    pub async fn add_remote_candidate(&mut self, candidate: crate::transport::IceCandidate) {
        let Some(candidate) = self.candidates.push(candidate) else {
            debug!(
                viewer_id = %self.key.viewer_id,
                queued = self.candidates.len(),
                "Queued candidate until remote description is set"
            );
            return;
        };
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(viewer_id = %self.key.viewer_id, error = %e, "Failed to add ICE candidate");
        }
    }

    /// Mark the remote description as applied and flush queued candidates in arrival order
    pub async fn drain_candidates(&mut self) {
        let queued = self.candidates.mark_remote_description_set();
        if queued.is_empty() {
            return;
        }

        debug!(viewer_id = %self.key.viewer_id, count = queued.len(), "Applying queued candidates");
        for candidate in queued {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(viewer_id = %self.key.viewer_id, error = %e, "Failed to add queued ICE candidate");
            }
        }
    }

    /// Fold a fresh transport report into a per-tick snapshot
    pub fn record_stats(&mut self, stats: TransportStats) -> StreamStats {
        let sample = StatsSample::now(stats);
        let snapshot = StreamStats::derive(self.last_sample.as_ref(), &sample, MediaDirection::Outbound);
        self.last_sample = Some(sample);
        snapshot
    }

    /// Stop event forwarding and close the transport
    pub async fn close(self) {
        self.forwarder.abort();
        if let Err(e) = self.transport.close().await {
            warn!(viewer_id = %self.key.viewer_id, error = %e, "Failed to close transport");
        }
    }
}
