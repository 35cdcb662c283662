use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use synctv_fanout::{
    logging,
    quality::ConnectionClass,
    transport::{MediaKind, RemoteTrack},
    Broadcaster, ConnectionState, FanoutConfig, FixedNetwork, LocalRelay, MediaSink, NetworkInfo, PeerId,
    StreamSession, Viewer, WebRtcMediaSource, WebRtcTransportFactory,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::media::Sample;

/// 20 ms of Opus silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const SAMPLE_DURATION: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "fanout-demo")]
#[command(about = "Loopback fan-out broadcast with in-process viewers", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "FANOUT_CONFIG")]
    config: Option<String>,

    /// Stream identifier
    #[arg(long, env = "FANOUT_STREAM_ID", default_value = "demo")]
    stream_id: String,

    /// Number of viewers to attach
    #[arg(long, env = "FANOUT_VIEWERS", default_value = "3")]
    viewers: usize,

    /// How long to run before shutting down, in seconds
    #[arg(long, env = "FANOUT_DURATION_SECS", default_value = "30")]
    duration_secs: u64,

    /// Downlink reported by every viewer, in Mbps
    #[arg(long, env = "FANOUT_DOWNLINK_MBPS")]
    downlink_mbps: Option<f64>,

    /// Round-trip time reported by every viewer, in milliseconds
    #[arg(long, env = "FANOUT_RTT_MS")]
    rtt_ms: Option<f64>,

    /// Effective connection class reported by every viewer (slow-2g, 2g, 3g, 4g)
    #[arg(long, env = "FANOUT_CONNECTION_CLASS")]
    connection_class: Option<ConnectionClass>,
}

/// Logs every track a viewer receives
struct LoggingSink {
    viewer_id: PeerId,
}

impl MediaSink for LoggingSink {
    fn on_track(&self, track: RemoteTrack) {
        let kind = match track.kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        info!(viewer_id = %self.viewer_id, track_id = %track.id, kind, "Receiving track");
    }
}

/// Feed silence into the audio track until cancelled
fn spawn_audio_pump(source: Arc<WebRtcMediaSource>, cancel_token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let track = source.audio_track();
        let mut ticker = tokio::time::interval(SAMPLE_DURATION);
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: SAMPLE_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!(error = %e, "Failed to write audio sample");
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = FanoutConfig::load(args.config.as_deref())?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("Config validation error: {problem}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            problems.len()
        ));
    }

    logging::init_logging(&config.logging)?;
    info!("Fan-out demo starting...");

    let config = Arc::new(config);
    let relay = Arc::new(LocalRelay::new());
    let factory = Arc::new(WebRtcTransportFactory::new()?);
    let session = StreamSession::new(args.stream_id.as_str(), "broadcaster");

    let network = Arc::new(FixedNetwork(NetworkInfo {
        effective_type: args.connection_class,
        downlink_mbps: args.downlink_mbps,
        rtt_ms: args.rtt_ms,
    }));

    let broadcaster = Broadcaster::new(
        session.clone(),
        config.clone(),
        relay.clone(),
        factory.clone(),
        network.clone(),
    );
    let source = Arc::new(WebRtcMediaSource::new(&args.stream_id));
    broadcaster.start(source.clone()).await?;

    let pump_token = CancellationToken::new();
    let pump = spawn_audio_pump(source, pump_token.clone());

    let mut viewers = Vec::with_capacity(args.viewers);
    for index in 0..args.viewers {
        let viewer_id = PeerId::new(format!("viewer-{index}"));
        let viewer = Viewer::new(
            session.clone(),
            viewer_id.clone(),
            config.clone(),
            relay.clone(),
            factory.clone(),
            network.clone(),
            Arc::new(LoggingSink {
                viewer_id: viewer_id.clone(),
            }),
        );
        if let Err(e) = viewer.connect().await {
            warn!(viewer_id = %viewer_id, error = %e, "Viewer failed to connect");
            continue;
        }
        info!(viewer_id = %viewer_id, tier = %viewer.current_tier(), "Viewer started");
        viewers.push(viewer);
    }

    let mut state_rx = broadcaster.subscribe_state();
    let mut count_rx = broadcaster.subscribe_viewer_count();
    let mut stats_rx = broadcaster.subscribe_stats();
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                info!("Demo duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                println!("broadcaster state: {state}");
                if state == ConnectionState::Failed {
                    break;
                }
            }
            Ok(()) = count_rx.changed() => {
                println!("viewer count: {}", *count_rx.borrow_and_update());
            }
            Ok(stats) = stats_rx.recv() => {
                println!(
                    "aggregate: {} kbps, rtt {:?} ms, score {}, tier {}",
                    stats.bitrate_kbps,
                    stats.rtt_ms,
                    stats.quality_score,
                    broadcaster.current_tier()
                );
            }
        }
    }

    for viewer in &viewers {
        println!("{}: {} at {}", viewer.viewer_id(), viewer.state(), viewer.current_tier());
        viewer.disconnect().await;
    }
    broadcaster.stop().await;

    pump_token.cancel();
    if let Err(e) = pump.await {
        warn!(error = %e, "Audio pump terminated abnormally");
    }

    info!("Fan-out demo stopped");
    Ok(())
}
