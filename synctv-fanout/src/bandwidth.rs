//! Network signals feeding the quality selector
//!
//! Both managers sample a [`NetworkObserver`] to pick their initial tier, and
//! the viewer keeps a [`NetworkSampler`] refreshing in the background for its
//! statistics ticks. Observers either report fixed signals (tests, hosts that
//! expose their own network information) or probe throughput through a
//! [`BandwidthProbe`].

use crate::error::{Error, Result};
use crate::quality::{select_quality_tier, ConnectionClass, QualityPreset};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Conservative downlink assumed when a probe cannot produce a measurement
pub const DEFAULT_BANDWIDTH_MBPS: f64 = 1.5;

/// Upper bound on a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a probed estimate is reused before probing again
pub const DEFAULT_PROBE_REFRESH: Duration = Duration::from_secs(30);

/// Locally observed network signals. Every field is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub effective_type: Option<ConnectionClass>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<f64>,
}

impl NetworkInfo {
    /// Whether any signal was observed at all
    #[must_use]
    pub const fn has_signals(&self) -> bool {
        self.effective_type.is_some() || self.downlink_mbps.is_some() || self.rtt_ms.is_some()
    }

    #[must_use]
    pub fn select_preset(&self) -> &'static QualityPreset {
        select_quality_tier(self.effective_type, self.downlink_mbps, self.rtt_ms)
    }
}

/// Measures achievable downlink throughput
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    /// Downlink in Mbps
    async fn measure(&self) -> Result<f64>;
}

/// Times the download of a probe resource
pub struct HttpBandwidthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpBandwidthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl BandwidthProbe for HttpBandwidthProbe {
    async fn measure(&self) -> Result<f64> {
        let started = std::time::Instant::now();
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        if body.is_empty() || elapsed <= 0.0 {
            return Err(Error::Probe(format!("empty probe response from {}", self.url)));
        }

        Ok((body.len() * 8) as f64 / elapsed / 1_000_000.0)
    }
}

/// Best-effort downlink estimate.
///
/// Never fails: probe errors, timeouts and nonsensical readings all yield
/// [`DEFAULT_BANDWIDTH_MBPS`].
pub async fn estimate_bandwidth(probe: &dyn BandwidthProbe) -> f64 {
    match tokio::time::timeout(PROBE_TIMEOUT, probe.measure()).await {
        Ok(Ok(mbps)) if mbps.is_finite() && mbps > 0.0 => mbps,
        Ok(Ok(mbps)) => {
            warn!(mbps, "Discarding invalid bandwidth measurement");
            DEFAULT_BANDWIDTH_MBPS
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Bandwidth probe failed, using default");
            DEFAULT_BANDWIDTH_MBPS
        }
        Err(_) => {
            warn!(timeout = ?PROBE_TIMEOUT, "Bandwidth probe timed out, using default");
            DEFAULT_BANDWIDTH_MBPS
        }
    }
}

/// Source of [`NetworkInfo`] samples
#[async_trait]
pub trait NetworkObserver: Send + Sync {
    async fn sample(&self) -> NetworkInfo;
}

/// Always reports the same signals
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedNetwork(pub NetworkInfo);

#[async_trait]
impl NetworkObserver for FixedNetwork {
    async fn sample(&self) -> NetworkInfo {
        self.0
    }
}

/// Exponentially smoothed estimate
#[derive(Debug)]
struct SmoothedEstimate {
    current: Option<f64>,
    measured_at: Option<Instant>,
    /// Weight kept from the previous value (0.8 = 80% weight on previous value)
    smoothing_factor: f64,
}

impl SmoothedEstimate {
    const fn new() -> Self {
        Self {
            current: None,
            measured_at: None,
            smoothing_factor: 0.8,
        }
    }

    fn record(&mut self, sample: f64, now: Instant) -> f64 {
        let next = match self.current {
            // new_estimate = α * old + (1-α) * new
            Some(old) => self.smoothing_factor.mul_add(old, (1.0 - self.smoothing_factor) * sample),
            None => sample,
        };
        self.current = Some(next);
        self.measured_at = Some(now);
        next
    }

    fn fresh(&self, now: Instant, refresh: Duration) -> Option<f64> {
        let measured_at = self.measured_at?;
        (now.saturating_duration_since(measured_at) < refresh)
            .then_some(self.current)
            .flatten()
    }
}

/// Derives the downlink from a probe, smoothing successive measurements and
/// reusing the estimate for `refresh`
pub struct ProbingNetwork {
    probe: Arc<dyn BandwidthProbe>,
    refresh: Duration,
    estimate: Mutex<SmoothedEstimate>,
}

impl ProbingNetwork {
    pub fn new(probe: Arc<dyn BandwidthProbe>) -> Self {
        Self {
            probe,
            refresh: DEFAULT_PROBE_REFRESH,
            estimate: Mutex::new(SmoothedEstimate::new()),
        }
    }

    #[must_use]
    pub const fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }
}

#[async_trait]
impl NetworkObserver for ProbingNetwork {
    async fn sample(&self) -> NetworkInfo {
        let cached = self.estimate.lock().fresh(Instant::now(), self.refresh);
        let downlink = match cached {
            Some(downlink) => downlink,
            None => {
                let measured = estimate_bandwidth(self.probe.as_ref()).await;
                let downlink = self.estimate.lock().record(measured, Instant::now());
                debug!(measured_mbps = measured, downlink_mbps = downlink, "Downlink estimate updated");
                downlink
            }
        };

        NetworkInfo {
            effective_type: None,
            downlink_mbps: Some(downlink),
            rtt_ms: None,
        }
    }
}

/// Latest sample of an observer, readable without awaiting.
///
/// A background task samples every `period` and publishes the result, so a
/// slow observer such as [`ProbingNetwork`] never holds up the reader.
pub struct NetworkSampler {
    latest: watch::Receiver<NetworkInfo>,
    task: JoinHandle<()>,
}

impl NetworkSampler {
    pub fn spawn(observer: Arc<dyn NetworkObserver>, initial: NetworkInfo, period: Duration) -> Self {
        let (tx, latest) = watch::channel(initial);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let info = observer.sample().await;
                if tx.send(info).is_err() {
                    break;
                }
            }
        });

        Self { latest, task }
    }

    #[must_use]
    pub fn latest(&self) -> NetworkInfo {
        *self.latest.borrow()
    }
}

impl Drop for NetworkSampler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityTier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        readings: Vec<Result<f64>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<Result<f64>>) -> Self {
            Self {
                readings,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BandwidthProbe for ScriptedProbe {
        async fn measure(&self) -> Result<f64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.readings.get(call) {
                Some(Ok(mbps)) => Ok(*mbps),
                _ => Err(Error::Probe("unreachable".to_string())),
            }
        }
    }

    struct StalledProbe;

    #[async_trait]
    impl BandwidthProbe for StalledProbe {
        async fn measure(&self) -> Result<f64> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_estimate_returns_measurement() {
        let probe = ScriptedProbe::new(vec![Ok(12.5)]);
        assert!((estimate_bandwidth(&probe).await - 12.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_estimate_falls_back_on_error() {
        let probe = ScriptedProbe::new(vec![]);
        assert!((estimate_bandwidth(&probe).await - DEFAULT_BANDWIDTH_MBPS).abs() < f64::EPSILON);

        let invalid = ScriptedProbe::new(vec![Ok(f64::NAN)]);
        assert!((estimate_bandwidth(&invalid).await - DEFAULT_BANDWIDTH_MBPS).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_falls_back_on_timeout() {
        let mbps = estimate_bandwidth(&StalledProbe).await;
        assert!((mbps - DEFAULT_BANDWIDTH_MBPS).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unreachable_http_probe_uses_default() {
        let probe = HttpBandwidthProbe::new("http://127.0.0.1:9/probe.bin");
        let mbps = estimate_bandwidth(&probe).await;
        assert!((mbps - DEFAULT_BANDWIDTH_MBPS).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_http_probe_measures_download() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/probe.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 256 * 1024]))
            .mount(&server)
            .await;

        let probe = HttpBandwidthProbe::new(format!("{}/probe.bin", server.uri()));
        let mbps = probe.measure().await.unwrap();
        assert!(mbps.is_finite() && mbps > 0.0);
    }

    #[tokio::test]
    async fn test_http_probe_rejects_error_status() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpBandwidthProbe::new(format!("{}/probe.bin", server.uri()));
        assert!(matches!(probe.measure().await, Err(Error::Probe(_))));
        let mbps = estimate_bandwidth(&probe).await;
        assert!((mbps - DEFAULT_BANDWIDTH_MBPS).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_network_smooths_and_caches() {
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(10.0), Ok(20.0)]));
        let network = ProbingNetwork::new(probe.clone()).with_refresh(Duration::from_secs(30));

        let first = network.sample().await;
        assert_eq!(first.downlink_mbps, Some(10.0));

        // Within the refresh window the cached value is reused
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(network.sample().await.downlink_mbps, Some(10.0));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let smoothed = network.sample().await.downlink_mbps.unwrap();
        assert!((smoothed - 12.0).abs() < 1e-9);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    /// Takes three seconds per sample
    struct SlowNetwork;

    #[async_trait]
    impl NetworkObserver for SlowNetwork {
        async fn sample(&self) -> NetworkInfo {
            tokio::time::sleep(Duration::from_secs(3)).await;
            NetworkInfo {
                downlink_mbps: Some(2.0),
                ..NetworkInfo::default()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_serves_cached_value_while_sampling() {
        let sampler = NetworkSampler::spawn(Arc::new(SlowNetwork), NetworkInfo::default(), Duration::from_secs(5));
        assert_eq!(sampler.latest(), NetworkInfo::default());

        // First sample runs from 5s to 8s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sampler.latest().downlink_mbps, None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sampler.latest().downlink_mbps, Some(2.0));
    }

    #[tokio::test]
    async fn test_fixed_network_selects_preset() {
        let network = FixedNetwork(NetworkInfo {
            effective_type: Some(ConnectionClass::ThreeG),
            downlink_mbps: Some(2.0),
            rtt_ms: Some(150.0),
        });
        assert_eq!(network.sample().await.select_preset().tier, QualityTier::Medium);
        assert_eq!(NetworkInfo::default().select_preset().tier, QualityTier::High);
    }
}
