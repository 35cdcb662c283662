//! Subscriber setup for fan-out sessions
//!
//! The webrtc-rs stack logs every ICE check and DTLS record at debug level,
//! which buries the session events. Its targets are held at `warn` unless
//! `RUST_LOG` asks for something else.

use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Engine crates that only matter when debugging the engine itself
const QUIET_TARGETS: &[&str] = &[
    "webrtc=warn",
    "webrtc_ice=warn",
    "webrtc_dtls=warn",
    "webrtc_srtp=warn",
    "webrtc_sctp=warn",
    "webrtc_mdns=warn",
    "interceptor=warn",
];

/// Initialize structured logging based on configuration
///
/// Session events carry `stream_id`, `viewer_id` and `connection_id` fields,
/// so the JSON format is the one to use when logs are shipped somewhere.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level, std::env::var("RUST_LOG").ok())?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => (BoxMakeWriter::new(Arc::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_line_number(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// `RUST_LOG` replaces the configured level and the engine quieting entirely
fn build_filter(level: &str, env_override: Option<String>) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(level)?;

    if let Some(directives) = env_override.filter(|d| !d.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }

    let mut filter = EnvFilter::new(level.to_string());
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

fn open_log_file(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
