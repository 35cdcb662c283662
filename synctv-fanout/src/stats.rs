//! Statistics snapshots
//!
//! Transports report cumulative counters ([`TransportStats`]). Each polling tick
//! turns the difference between two samples into an ephemeral [`StreamStats`]
//! snapshot, and the broadcaster folds per-viewer snapshots into one aggregate.
//!
//! ## Quality Score
//! - 5: Excellent (RTT < 200ms, loss < 5%, low jitter)
//! - 3-4: Degraded (RTT >= 200ms or loss >= 5% or jitter above threshold)
//! - 0-2: Bad (RTT >= 300ms combined with heavy loss)

use crate::quality::JITTER_HIGH_MS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Why the sender is currently not reaching its target quality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLimitationReason {
    #[default]
    None,
    Cpu,
    Bandwidth,
    Other,
}

impl QualityLimitationReason {
    /// Severity used when merging reasons from several sessions
    const fn severity(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Other => 1,
            Self::Cpu => 2,
            Self::Bandwidth => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[must_use]
    pub const fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Cumulative counters as reported by a transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub frames_per_second: Option<f64>,
    pub resolution: Option<Resolution>,
    pub jitter_ms: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub quality_limitation_reason: QualityLimitationReason,
}

/// A transport report stamped with the time it was taken
#[derive(Debug, Clone)]
pub struct StatsSample {
    pub taken_at: Instant,
    pub stats: TransportStats,
}

impl StatsSample {
    #[must_use]
    pub fn now(stats: TransportStats) -> Self {
        Self {
            taken_at: Instant::now(),
            stats,
        }
    }
}

/// Which counters carry the media for the session being sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    Outbound,
    Inbound,
}

/// Derived, ephemeral statistics for one polling tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub bitrate_kbps: u32,
    pub frame_rate: Option<f64>,
    pub resolution: Option<Resolution>,
    /// Packets lost during this tick
    pub packets_lost: u64,
    /// Loss rate during this tick (0.0 - 1.0)
    pub packet_loss_rate: f64,
    pub jitter_ms: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub quality_limitation_reason: QualityLimitationReason,
    /// Quality score (0-5)
    pub quality_score: u8,
    pub sampled_at: DateTime<Utc>,
}

impl StreamStats {
    /// Derive a snapshot from the current sample and the previous one (if any)
    #[must_use]
    pub fn derive(
        previous: Option<&StatsSample>,
        current: &StatsSample,
        direction: MediaDirection,
    ) -> Self {
        let counters = |s: &TransportStats| match direction {
            MediaDirection::Outbound => (s.bytes_sent, s.packets_sent),
            MediaDirection::Inbound => (s.bytes_received, s.packets_received),
        };
        let (bytes_now, packets_now) = counters(&current.stats);
        let (bytes_before, packets_before) = previous.map_or((0, 0), |p| counters(&p.stats));
        let bytes = bytes_now.saturating_sub(bytes_before);
        let packets = packets_now.saturating_sub(packets_before);

        let elapsed = previous
            .map(|p| current.taken_at.saturating_duration_since(p.taken_at).as_secs_f64())
            .unwrap_or_default();
        let bitrate_kbps = if elapsed > 0.0 {
            ((bytes * 8) as f64 / elapsed / 1000.0) as u32
        } else {
            0
        };

        let lost_before = previous.map_or(0, |p| p.stats.packets_lost);
        let packets_lost = current.stats.packets_lost.saturating_sub(lost_before);
        let packet_loss_rate = if packets + packets_lost > 0 {
            packets_lost as f64 / (packets + packets_lost) as f64
        } else {
            0.0
        };

        let mut stats = Self {
            bitrate_kbps,
            frame_rate: current.stats.frames_per_second,
            resolution: current.stats.resolution,
            packets_lost,
            packet_loss_rate,
            jitter_ms: current.stats.jitter_ms,
            rtt_ms: current.stats.rtt_ms,
            quality_limitation_reason: current.stats.quality_limitation_reason,
            quality_score: 0,
            sampled_at: Utc::now(),
        };
        stats.quality_score = stats.score();
        stats
    }

    /// Fold per-session snapshots into one broadcaster-wide snapshot
    #[must_use]
    pub fn aggregate(snapshots: &[Self]) -> Option<Self> {
        if snapshots.is_empty() {
            return None;
        }

        let mut stats = Self {
            bitrate_kbps: snapshots.iter().map(|s| s.bitrate_kbps).sum(),
            frame_rate: mean(snapshots.iter().filter_map(|s| s.frame_rate)),
            resolution: snapshots
                .iter()
                .filter_map(|s| s.resolution)
                .max_by_key(Resolution::pixels),
            packets_lost: snapshots.iter().map(|s| s.packets_lost).sum(),
            packet_loss_rate: mean(snapshots.iter().map(|s| s.packet_loss_rate)).unwrap_or(0.0),
            jitter_ms: mean(snapshots.iter().filter_map(|s| s.jitter_ms)),
            rtt_ms: mean(snapshots.iter().filter_map(|s| s.rtt_ms)),
            quality_limitation_reason: snapshots
                .iter()
                .map(|s| s.quality_limitation_reason)
                .max_by_key(|reason| reason.severity())
                .unwrap_or_default(),
            quality_score: 0,
            sampled_at: Utc::now(),
        };
        stats.quality_score = stats.score();
        Some(stats)
    }

    fn score(&self) -> u8 {
        calculate_quality_score(
            self.rtt_ms.unwrap_or(0.0),
            self.packet_loss_rate,
            self.jitter_ms.unwrap_or(0.0),
        )
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Calculate quality score (0-5) based on network conditions
fn calculate_quality_score(rtt_ms: f64, packet_loss_rate: f64, jitter_ms: f64) -> u8 {
    let mut score: i8 = 5;

    // RTT penalties
    if rtt_ms >= 300.0 {
        score -= 2;
    } else if rtt_ms >= 200.0 {
        score -= 1;
    }

    // Packet loss penalties
    if packet_loss_rate >= 0.15 {
        score -= 3;
    } else if packet_loss_rate >= 0.10 {
        score -= 2;
    } else if packet_loss_rate >= 0.05 {
        score -= 1;
    }

    if jitter_ms > JITTER_HIGH_MS {
        score -= 1;
    }

    score.clamp(0, 5) as u8
}
