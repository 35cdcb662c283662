//! Quality catalog
//!
//! Static decision support for both session managers:
//! - the ordered tier catalog (`ultra > high > medium > low > mobile`)
//! - tier selection from observed network signals
//! - per-session encoding parameters
//! - the one-step adaptation rule driven by aggregated statistics

use crate::error::Error;
use crate::stats::{QualityLimitationReason, StreamStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// RTT above which the network is considered poor (ms)
pub const RTT_POOR_MS: f64 = 300.0;

/// RTT below which the network is considered good enough to step up (ms)
pub const RTT_GOOD_MS: f64 = 100.0;

/// Jitter above which playback needs a deeper buffer (ms)
pub const JITTER_HIGH_MS: f64 = 30.0;

/// Tier used when no network signal is available at all
pub const DEFAULT_TIER: QualityTier = QualityTier::High;

/// Video codecs in descending order of preference
pub const CODEC_PREFERENCE: [&str; 4] = ["H264", "VP8", "VP9", "AV1"];

/// Named quality tier. Ordered from poorest to richest so that `Ord` follows richness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Mobile,
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    /// The catalog, richest first
    pub const CATALOG: [Self; 5] = [Self::Ultra, Self::High, Self::Medium, Self::Low, Self::Mobile];

    pub const HIGHEST: Self = Self::Ultra;
    pub const LOWEST: Self = Self::Mobile;

    #[must_use]
    pub fn preset(&self) -> &'static QualityPreset {
        match self {
            Self::Ultra => &PRESETS[0],
            Self::High => &PRESETS[1],
            Self::Medium => &PRESETS[2],
            Self::Low => &PRESETS[3],
            Self::Mobile => &PRESETS[4],
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.preset().name
    }

    /// One catalog step down, `None` at the bottom
    #[must_use]
    pub const fn lower(&self) -> Option<Self> {
        match self {
            Self::Ultra => Some(Self::High),
            Self::High => Some(Self::Medium),
            Self::Medium => Some(Self::Low),
            Self::Low => Some(Self::Mobile),
            Self::Mobile => None,
        }
    }

    /// One catalog step up, `None` at the top
    #[must_use]
    pub const fn higher(&self) -> Option<Self> {
        match self {
            Self::Mobile => Some(Self::Low),
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => Some(Self::Ultra),
            Self::Ultra => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QualityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CATALOG
            .into_iter()
            .find(|tier| tier.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownTier(s.to_string()))
    }
}

/// Immutable description of one catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityPreset {
    pub tier: QualityTier,
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    pub key_frame_interval_ms: u32,
}

impl QualityPreset {
    #[must_use]
    pub const fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
        }
    }
}

static PRESETS: [QualityPreset; 5] = [
    QualityPreset {
        tier: QualityTier::Ultra,
        name: "ultra",
        width: 1920,
        height: 1080,
        frame_rate: 30,
        bitrate_kbps: 4500,
        key_frame_interval_ms: 2000,
    },
    QualityPreset {
        tier: QualityTier::High,
        name: "high",
        width: 1280,
        height: 720,
        frame_rate: 30,
        bitrate_kbps: 2500,
        key_frame_interval_ms: 2000,
    },
    QualityPreset {
        tier: QualityTier::Medium,
        name: "medium",
        width: 854,
        height: 480,
        frame_rate: 30,
        bitrate_kbps: 1200,
        key_frame_interval_ms: 2000,
    },
    QualityPreset {
        tier: QualityTier::Low,
        name: "low",
        width: 640,
        height: 360,
        frame_rate: 24,
        bitrate_kbps: 600,
        key_frame_interval_ms: 3000,
    },
    QualityPreset {
        tier: QualityTier::Mobile,
        name: "mobile",
        width: 426,
        height: 240,
        frame_rate: 15,
        bitrate_kbps: 300,
        key_frame_interval_ms: 4000,
    },
];

/// Capture settings requested from the media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Coarse connection class as reported by the platform network information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl FromStr for ConnectionClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slow-2g" => Ok(Self::Slow2g),
            "2g" => Ok(Self::TwoG),
            "3g" => Ok(Self::ThreeG),
            "4g" => Ok(Self::FourG),
            other => Err(Error::UnknownTier(format!("connection class {other}"))),
        }
    }
}

/// Select the richest tier the observed network can sustain.
///
/// Missing signals never trigger a threshold. With no signal at all the
/// [`DEFAULT_TIER`] is used.
#[must_use]
pub fn select_quality_tier(
    effective_type: Option<ConnectionClass>,
    downlink_mbps: Option<f64>,
    rtt_ms: Option<f64>,
) -> &'static QualityPreset {
    if effective_type.is_none() && downlink_mbps.is_none() && rtt_ms.is_none() {
        return DEFAULT_TIER.preset();
    }

    let below = |limit: f64| downlink_mbps.is_some_and(|d| d < limit);
    let above = |limit: f64| rtt_ms.is_some_and(|r| r > limit);
    let slow_class = matches!(effective_type, Some(ConnectionClass::Slow2g | ConnectionClass::TwoG));

    let tier = if below(0.5) || slow_class {
        QualityTier::Mobile
    } else if below(1.5) || above(300.0) {
        QualityTier::Low
    } else if below(3.0) || above(200.0) {
        QualityTier::Medium
    } else if below(6.0) || above(100.0) {
        QualityTier::High
    } else {
        QualityTier::Ultra
    };

    tier.preset()
}

/// Priority hint passed to the transport's sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingPriority {
    VeryLow,
    Low,
    Medium,
    High,
}

/// Sender encoding parameters for one outbound session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    /// Maximum bitrate in bits per second
    pub max_bitrate: u32,
    pub max_framerate: u32,
    pub priority: EncodingPriority,
}

/// Optional per-field replacements applied on top of a preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingOverride {
    pub max_bitrate_kbps: Option<u32>,
    pub max_framerate: Option<u32>,
    pub priority: Option<EncodingPriority>,
}

impl EncodingOverride {
    /// Override that caps the preset bitrate (0 = unlimited)
    #[must_use]
    pub fn bitrate_cap(preset: &QualityPreset, cap_kbps: u32) -> Option<Self> {
        (cap_kbps > 0 && cap_kbps < preset.bitrate_kbps).then_some(Self {
            max_bitrate_kbps: Some(cap_kbps),
            ..Self::default()
        })
    }
}

#[must_use]
pub fn build_encoding_parameters(
    preset: &QualityPreset,
    overrides: Option<&EncodingOverride>,
) -> EncodingParameters {
    let overrides = overrides.copied().unwrap_or_default();
    EncodingParameters {
        max_bitrate: overrides.max_bitrate_kbps.unwrap_or(preset.bitrate_kbps) * 1000,
        max_framerate: overrides.max_framerate.unwrap_or(preset.frame_rate),
        priority: overrides.priority.unwrap_or(EncodingPriority::High),
    }
}

/// RTT thresholds used by [`adapt_tier`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptationThresholds {
    pub poor_rtt_ms: f64,
    pub good_rtt_ms: f64,
}

impl Default for AdaptationThresholds {
    fn default() -> Self {
        Self {
            poor_rtt_ms: RTT_POOR_MS,
            good_rtt_ms: RTT_GOOD_MS,
        }
    }
}

/// Evaluate one statistics tick: at most one catalog step in either direction.
#[must_use]
pub fn adapt_tier(
    current: QualityTier,
    stats: &StreamStats,
    thresholds: &AdaptationThresholds,
) -> QualityTier {
    let bandwidth_limited = stats.quality_limitation_reason == QualityLimitationReason::Bandwidth;
    let rtt_poor = stats.rtt_ms.is_some_and(|rtt| rtt > thresholds.poor_rtt_ms);
    let rtt_good = stats.rtt_ms.is_some_and(|rtt| rtt < thresholds.good_rtt_ms);

    if bandwidth_limited || rtt_poor {
        current.lower().unwrap_or(current)
    } else if rtt_good && stats.packets_lost == 0 {
        current.higher().unwrap_or(current)
    } else {
        current
    }
}
