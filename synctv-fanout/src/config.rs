//! Fan-out configuration

use crate::quality::{QualityTier, CODEC_PREFERENCE, RTT_GOOD_MS, RTT_POOR_MS};
use config::{Config as ConfigBuilder, ConfigError, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration shared by both session managers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub ice: IceConfig,
    pub quality: QualityConfig,
    pub timing: TimingConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

/// NAT traversal servers handed to every transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn: Option<TurnConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn: None,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub server_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Video codec moved to the front of every offer
    pub preferred_codec: String,
    /// Broadcaster default before the first adaptation tick
    pub initial_tier: QualityTier,
    /// Maximum bitrate per peer (kbps, 0 = unlimited)
    pub max_bitrate_per_peer_kbps: u32,
    pub poor_rtt_ms: f64,
    pub good_rtt_ms: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            preferred_codec: CODEC_PREFERENCE[0].to_string(),
            initial_tier: QualityTier::High,
            max_bitrate_per_peer_kbps: 0,
            poor_rtt_ms: RTT_POOR_MS,
            good_rtt_ms: RTT_GOOD_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub broadcaster_poll_interval_ms: u64,
    pub viewer_poll_interval_ms: u64,
    /// Upper bound on a single statistics request
    pub stats_timeout_ms: u64,
    /// How long a viewer waits for the first remote track
    pub establishment_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            broadcaster_poll_interval_ms: 2000,
            viewer_poll_interval_ms: 5000,
            stats_timeout_ms: 1000,
            establishment_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub const fn broadcaster_poll_interval(&self) -> Duration {
        Duration::from_millis(self.broadcaster_poll_interval_ms)
    }

    #[must_use]
    pub const fn viewer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.viewer_poll_interval_ms)
    }

    #[must_use]
    pub const fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    #[must_use]
    pub const fn establishment_timeout(&self) -> Duration {
        Duration::from_millis(self.establishment_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First backoff delay; doubled for every further attempt
    pub base_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl FanoutConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, None)
    }

    /// Same as [`FanoutConfig::load`], reading variables from `env` instead of the
    /// process environment when given
    pub fn load_with_env(
        config_file: Option<&str>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // FANOUT_TIMING__VIEWER_POLL_INTERVAL_MS, FANOUT_QUALITY__INITIAL_TIER, ...
        builder = builder.add_source(
            Environment::with_prefix("FANOUT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_servers")
                .try_parsing(true)
                .source(env),
        );

        builder.build()?.try_deserialize()
    }

    /// Check values the managers cannot work with. Returns every problem found.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.quality.preferred_codec.trim().is_empty() {
            problems.push("quality.preferred_codec must not be empty".to_string());
        }
        if self.quality.good_rtt_ms >= self.quality.poor_rtt_ms {
            problems.push(format!(
                "quality.good_rtt_ms ({}) must be below quality.poor_rtt_ms ({})",
                self.quality.good_rtt_ms, self.quality.poor_rtt_ms
            ));
        }
        for (name, value) in [
            ("timing.broadcaster_poll_interval_ms", self.timing.broadcaster_poll_interval_ms),
            ("timing.viewer_poll_interval_ms", self.timing.viewer_poll_interval_ms),
            ("timing.stats_timeout_ms", self.timing.stats_timeout_ms),
            ("timing.establishment_timeout_ms", self.timing.establishment_timeout_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        if self.reconnect.max_attempts == 0 {
            problems.push("reconnect.max_attempts must be greater than zero".to_string());
        }
        if let Some(turn) = &self.ice.turn {
            if !turn.server_url.starts_with("turn:") && !turn.server_url.starts_with("turns:") {
                problems.push(format!("ice.turn.server_url is not a TURN url: {}", turn.server_url));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            problems.push(format!("logging.format must be json or pretty, got {}", self.logging.format));
        }

        problems
    }

    /// [`FanoutConfig::validate`] as a single error listing every problem
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ConfigError::Message(format!(
            "invalid configuration: {}",
            problems.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = FanoutConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert_eq!(config.quality.preferred_codec, "H264");
        assert_eq!(config.quality.initial_tier, QualityTier::High);
        assert_eq!(config.timing.broadcaster_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.timing.viewer_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.timing.establishment_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_environment_overrides() {
        let config = FanoutConfig::load_with_env(
            None,
            env(&[
                ("FANOUT_QUALITY__INITIAL_TIER", "low"),
                ("FANOUT_QUALITY__MAX_BITRATE_PER_PEER_KBPS", "800"),
                ("FANOUT_RECONNECT__MAX_ATTEMPTS", "3"),
                ("FANOUT_ICE__STUN_SERVERS", "stun:a.example:3478,stun:b.example:3478"),
            ]),
        )
        .unwrap();

        assert_eq!(config.quality.initial_tier, QualityTier::Low);
        assert_eq!(config.quality.max_bitrate_per_peer_kbps, 800);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(
            config.ice.stun_servers,
            ["stun:a.example:3478", "stun:b.example:3478"]
        );
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = FanoutConfig::default();
        config.quality.good_rtt_ms = 400.0;
        config.timing.viewer_poll_interval_ms = 0;
        config.reconnect.max_attempts = 0;
        config.logging.format = "xml".to_string();
        config.ice.turn = Some(TurnConfig {
            server_url: "stun:wrong.example".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        });

        let problems = config.validate();
        assert_eq!(problems.len(), 5, "{problems:?}");

        let err = config.ensure_valid().unwrap_err().to_string();
        assert!(err.contains("timing.viewer_poll_interval_ms must be greater than zero"), "{err}");
        assert!(FanoutConfig::default().ensure_valid().is_ok());
    }
}
