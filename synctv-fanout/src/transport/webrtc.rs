//! Transport implementation on top of webrtc-rs
//!
//! One [`WebRtcTransport`] wraps one `RTCPeerConnection`. Engine callbacks are
//! forwarded as [`TransportEvent`]s on the channel returned by the factory.

use super::{
    IceCandidate, LocalTrack, MediaKind, MediaSource, PeerTransport, RemoteTrack, SdpType,
    SessionDescription, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
use crate::config::IceConfig;
use crate::error::{Error, Result};
use crate::quality::{CaptureConstraints, EncodingParameters};
use crate::stats::{QualityLimitationReason, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Builds peer connections sharing one media engine configuration
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }

    fn rtc_configuration(ice: &IceConfig) -> RTCConfiguration {
        let mut ice_servers = Vec::new();
        if !ice.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice.stun_servers.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &ice.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.server_url.clone()],
                username: turn.username.clone(),
                credential: turn.password.clone(),
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, ice: &IceConfig) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(Self::rtc_configuration(ice))
                .await?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = tx.send(TransportEvent::StateChange(map_state(state)));
            Box::pin(async {})
        }));

        let tx = events_tx;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let id = track.id();
            let handle: Arc<dyn Any + Send + Sync> = track;
            let _ = tx.send(TransportEvent::Track(RemoteTrack::new(id, kind, handle)));
            Box::pin(async {})
        }));

        let transport: Arc<dyn PeerTransport> = Arc::new(WebRtcTransport {
            pc,
            encoding: Mutex::new(None),
            monitor: Mutex::new(LinkMonitor::default()),
        });
        Ok((transport, events_rx))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

/// RTT samples older than this no longer count towards jitter
const RTT_WINDOW: Duration = Duration::from_secs(10);
/// Remote-reported loss above which the link is treated as congested
const CONGESTED_LOSS_FRACTION: f64 = 0.10;
/// Achieved send rate below this share of `max_bitrate` counts as an undershoot
const UNDERSHOOT_RATIO: f64 = 0.5;
/// Consecutive undershooting reports before the link is blamed
const UNDERSHOOT_REPORTS: u32 = 3;

/// Signals webrtc-rs does not report directly, derived across stats reports.
///
/// Jitter is the spread of RTT over [`RTT_WINDOW`]. The limitation reason is
/// `bandwidth` on heavy remote loss, or when the send rate keeps falling well
/// short of the recorded encoding cap.
#[derive(Debug, Default)]
struct LinkMonitor {
    rtt_samples: VecDeque<(Instant, f64)>,
    last_sent: Option<(Instant, u64)>,
    undershoot_streak: u32,
}

impl LinkMonitor {
    fn observe(
        &mut self,
        now: Instant,
        stats: &mut TransportStats,
        fraction_lost: f64,
        max_bitrate: Option<u32>,
    ) {
        if let Some(rtt) = stats.rtt_ms {
            self.rtt_samples.push_back((now, rtt));
        }
        while self
            .rtt_samples
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > RTT_WINDOW)
        {
            self.rtt_samples.pop_front();
        }
        stats.jitter_ms = rtt_deviation(self.rtt_samples.iter().map(|(_, rtt)| *rtt));

        let sent_bps = self.last_sent.and_then(|(at, bytes)| {
            let elapsed = now.saturating_duration_since(at).as_secs_f64();
            (elapsed > 0.0).then(|| stats.bytes_sent.saturating_sub(bytes) as f64 * 8.0 / elapsed)
        });
        self.last_sent = Some((now, stats.bytes_sent));

        // Nothing sent means no media is flowing, not a starved link
        let undershoot = match (sent_bps, max_bitrate) {
            (Some(sent), Some(max)) if sent > 0.0 && max > 0 => {
                sent < f64::from(max) * UNDERSHOOT_RATIO
            }
            _ => false,
        };
        self.undershoot_streak = if undershoot { self.undershoot_streak + 1 } else { 0 };

        stats.quality_limitation_reason = limitation_reason(fraction_lost, self.undershoot_streak);
    }
}

/// Population standard deviation; needs at least two samples
fn rtt_deviation(samples: impl Iterator<Item = f64> + Clone) -> Option<f64> {
    let count = samples.clone().count();
    if count < 2 {
        return None;
    }
    let mean = samples.clone().sum::<f64>() / count as f64;
    let variance = samples.map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
    Some(variance.sqrt())
}

fn limitation_reason(fraction_lost: f64, undershoot_streak: u32) -> QualityLimitationReason {
    if fraction_lost > CONGESTED_LOSS_FRACTION || undershoot_streak >= UNDERSHOOT_REPORTS {
        QualityLimitationReason::Bandwidth
    } else {
        QualityLimitationReason::None
    }
}

/// A single `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Last encoding parameters requested for the outbound senders
    encoding: Mutex<Option<EncodingParameters>>,
    monitor: Mutex<LinkMonitor>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> =
            if let Ok(sample) = track.handle.clone().downcast::<TrackLocalStaticSample>() {
                sample
            } else if let Ok(rtp) = track.handle.clone().downcast::<TrackLocalStaticRTP>() {
                rtp
            } else {
                return Err(Error::Transport(format!(
                    "track {} is not backed by a webrtc local track",
                    track.id
                )));
            };

        let sender = self.pc.add_track(local).await?;

        // RTCP has to be read for the interceptors (NACK, reports) to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!(track_id = %track.id, kind = ?track.kind, "Track attached");
        Ok(())
    }

    async fn encoding_parameters(&self) -> Option<EncodingParameters> {
        *self.encoding.lock()
    }

    async fn set_encoding_parameters(&self, parameters: EncodingParameters) -> Result<()> {
        // RTCRtpSender exposes no per-encoding bitrate control
        debug!(
            max_bitrate = parameters.max_bitrate,
            max_framerate = parameters.max_framerate,
            priority = ?parameters.priority,
            "Encoding parameters updated"
        );
        *self.encoding.lock() = Some(parameters);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        let mut remote_rtt: Option<f64> = None;
        let mut candidate_rtt: Option<f64> = None;
        let mut fraction_lost = 0.0_f64;

        for report in report.reports.values() {
            match report {
                StatsReportType::OutboundRTP(outbound) => {
                    stats.bytes_sent += outbound.bytes_sent;
                    stats.packets_sent += outbound.packets_sent;
                }
                StatsReportType::InboundRTP(inbound) => {
                    stats.bytes_received += inbound.bytes_received;
                    stats.packets_received += inbound.packets_received;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                    fraction_lost = fraction_lost.max(remote.fraction_lost);
                    if let Some(rtt) = remote.round_trip_time.filter(|rtt| *rtt > 0.0) {
                        remote_rtt = Some(remote_rtt.map_or(rtt, |seen| seen.max(rtt)));
                    }
                }
                StatsReportType::CandidatePair(pair) if pair.current_round_trip_time > 0.0 => {
                    candidate_rtt = Some(pair.current_round_trip_time);
                }
                _ => {}
            }
        }

        // Seconds in the report
        stats.rtt_ms = remote_rtt.or(candidate_rtt).map(|rtt| rtt * 1000.0);
        let max_bitrate = self.encoding.lock().as_ref().map(|e| e.max_bitrate);
        self.monitor
            .lock()
            .observe(Instant::now(), &mut stats, fraction_lost, max_bitrate);

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Synthetic capture exposing one Opus audio and one H264 video track
pub struct WebRtcMediaSource {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    constraints: Mutex<Option<CaptureConstraints>>,
}

impl WebRtcMediaSource {
    pub fn new(stream_label: &str) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_label.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_label.to_owned(),
        ));

        Self {
            audio,
            video,
            constraints: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    #[must_use]
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }

    /// Constraints most recently requested by the broadcaster
    #[must_use]
    pub fn constraints(&self) -> Option<CaptureConstraints> {
        *self.constraints.lock()
    }
}

#[async_trait]
impl MediaSource for WebRtcMediaSource {
    fn tracks(&self) -> Vec<LocalTrack> {
        let audio: Arc<dyn Any + Send + Sync> = self.audio.clone();
        let video: Arc<dyn Any + Send + Sync> = self.video.clone();
        vec![
            LocalTrack::new("audio", MediaKind::Audio, audio),
            LocalTrack::new("video", MediaKind::Video, video),
        ]
    }

    async fn apply_constraints(&self, constraints: CaptureConstraints) -> Result<()> {
        info!(
            width = constraints.width,
            height = constraints.height,
            frame_rate = constraints.frame_rate,
            "Capture constraints applied"
        );
        *self.constraints.lock() = Some(constraints);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnConfig;

    #[test]
    fn test_rtc_configuration_includes_turn() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.example:3478".to_string()],
            turn: Some(TurnConfig {
                server_url: "turn:turn.example:3478".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
        };
        let config = WebRtcTransportFactory::rtc_configuration(&ice);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "user");

        let empty = WebRtcTransportFactory::rtc_configuration(&IceConfig {
            stun_servers: vec![],
            turn: None,
        });
        assert!(empty.ice_servers.is_empty());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), TransportState::Connected);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), TransportState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), TransportState::New);
    }

    fn observe(
        monitor: &mut LinkMonitor,
        at: Instant,
        bytes_sent: u64,
        rtt_ms: Option<f64>,
        fraction_lost: f64,
        max_bitrate: Option<u32>,
    ) -> TransportStats {
        let mut stats = TransportStats {
            bytes_sent,
            rtt_ms,
            ..TransportStats::default()
        };
        monitor.observe(at, &mut stats, fraction_lost, max_bitrate);
        stats
    }

    #[test]
    fn test_jitter_from_rtt_spread() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::default();

        let first = observe(&mut monitor, start, 0, Some(100.0), 0.0, None);
        assert_eq!(first.jitter_ms, None);

        for (i, rtt) in [140.0, 100.0, 140.0].into_iter().enumerate() {
            let at = start + Duration::from_secs(2 * (i as u64 + 1));
            observe(&mut monitor, at, 0, Some(rtt), 0.0, None);
        }
        let stats = observe(&mut monitor, start + Duration::from_secs(8), 0, None, 0.0, None);
        let jitter = stats.jitter_ms.unwrap();
        assert!((jitter - 20.0).abs() < 1e-9, "{jitter}");

        // Only the 140 ms sample at t=6 s is left in the window
        let stale = observe(&mut monitor, start + Duration::from_secs(15), 0, None, 0.0, None);
        assert_eq!(stale.jitter_ms, None);
    }

    #[test]
    fn test_steady_rtt_has_no_jitter() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::default();
        observe(&mut monitor, start, 0, Some(80.0), 0.0, None);
        let stats = observe(&mut monitor, start + Duration::from_secs(2), 0, Some(80.0), 0.0, None);
        assert_eq!(stats.jitter_ms, Some(0.0));
    }

    #[test]
    fn test_heavy_remote_loss_is_bandwidth_limited() {
        let mut monitor = LinkMonitor::default();
        let stats = observe(&mut monitor, Instant::now(), 0, Some(80.0), 0.25, None);
        assert_eq!(stats.quality_limitation_reason, QualityLimitationReason::Bandwidth);

        let light = observe(&mut monitor, Instant::now(), 0, Some(80.0), 0.05, None);
        assert_eq!(light.quality_limitation_reason, QualityLimitationReason::None);
    }

    #[test]
    fn test_sustained_undershoot_is_bandwidth_limited() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::default();
        let cap = Some(2_500_000);

        // 250 kB per second = 2 Mbps, close to the cap
        let mut bytes = 0;
        for second in 0..4 {
            bytes += 250_000;
            let stats = observe(&mut monitor, start + Duration::from_secs(second), bytes, None, 0.0, cap);
            assert_eq!(stats.quality_limitation_reason, QualityLimitationReason::None);
        }

        // 50 kB per second = 400 kbps, far below the cap
        let mut reasons = Vec::new();
        for second in 4..7 {
            bytes += 50_000;
            let stats = observe(&mut monitor, start + Duration::from_secs(second), bytes, None, 0.0, cap);
            reasons.push(stats.quality_limitation_reason);
        }
        assert_eq!(
            reasons,
            [
                QualityLimitationReason::None,
                QualityLimitationReason::None,
                QualityLimitationReason::Bandwidth
            ]
        );

        // Back near the cap clears the streak
        bytes += 300_000;
        let stats = observe(&mut monitor, start + Duration::from_secs(7), bytes, None, 0.0, cap);
        assert_eq!(stats.quality_limitation_reason, QualityLimitationReason::None);
    }

    #[test]
    fn test_idle_sender_is_not_bandwidth_limited() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::default();
        for second in 0..5 {
            let stats = observe(&mut monitor, start + Duration::from_secs(second), 0, None, 0.0, Some(600_000));
            assert_eq!(stats.quality_limitation_reason, QualityLimitationReason::None);
        }
    }

    #[tokio::test]
    async fn test_media_source_tracks_attach_to_transport() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let ice = IceConfig {
            stun_servers: vec![],
            turn: None,
        };
        let (transport, _events) = factory.create(&ice).await.unwrap();
        let source = WebRtcMediaSource::new("stream");

        for track in source.tracks() {
            transport.add_track(&track).await.unwrap();
        }
        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let foreign = LocalTrack::new("bogus", MediaKind::Video, Arc::new(42u32));
        assert!(transport.add_track(&foreign).await.is_err());

        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.quality_limitation_reason, QualityLimitationReason::None);
        assert_eq!(stats.rtt_ms, None);

        transport.close().await.unwrap();
    }
}
