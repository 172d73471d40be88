//! Connection quality detection and the sync strategy it selects.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::models::SyncPriority;

/// Discrete connection tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Slow,
    Medium,
    Fast,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
        })
    }
}

impl ConnectionQuality {
    /// Classify a measured throughput in megabits per second.
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps < 1.0 {
            Self::Slow
        } else if mbps < 10.0 {
            Self::Medium
        } else {
            Self::Fast
        }
    }
}

/// Transmission parameters for one connection tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStrategy {
    pub batch_size: usize,
    pub retry_delay: Duration,
    pub compression: bool,
    pub delta_sync: bool,
    /// Lowest priority transmitted on this tier
    pub priority: SyncPriority,
}

impl SyncStrategy {
    pub const fn for_quality(quality: ConnectionQuality) -> Self {
        match quality {
            ConnectionQuality::Slow => Self {
                batch_size: 2,
                retry_delay: Duration::from_secs(10),
                compression: true,
                delta_sync: true,
                priority: SyncPriority::Critical,
            },
            ConnectionQuality::Medium => Self {
                batch_size: 5,
                retry_delay: Duration::from_secs(5),
                compression: true,
                delta_sync: true,
                priority: SyncPriority::High,
            },
            ConnectionQuality::Fast => Self {
                batch_size: 20,
                retry_delay: Duration::from_secs(2),
                compression: false,
                delta_sync: false,
                priority: SyncPriority::Low,
            },
        }
    }
}

/// One throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl ProbeSample {
    pub fn mbps(&self) -> Option<f64> {
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return None;
        }
        Some(self.bytes as f64 * 8.0 / 1_000_000.0 / seconds)
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.mbps()
            .map_or(ConnectionQuality::Fast, ConnectionQuality::from_mbps)
    }
}

/// Source of throughput measurements.
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeSample>;
}

/// Downloads a small resource and times it.
pub struct HttpBandwidthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpBandwidthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl BandwidthProbe for HttpBandwidthProbe {
    async fn probe(&self) -> Result<ProbeSample> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Remote {
                status: Some(response.status().as_u16()),
                message: format!("bandwidth probe {}", self.url),
            });
        }
        let body = response.bytes().await?;
        Ok(ProbeSample {
            bytes: u64::try_from(body.len()).unwrap_or(u64::MAX),
            elapsed: started.elapsed(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Resource downloaded by the HTTP probe
    pub probe_url: Option<String>,
    pub probe_timeout_ms: u64,
    /// Re-probe period
    pub interval_ms: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_timeout_ms: 10_000,
            interval_ms: 300_000,
        }
    }
}

struct Inner {
    probe: Option<Arc<dyn BandwidthProbe>>,
    interval: Duration,
    quality: Mutex<ConnectionQuality>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks the current connection tier.
#[derive(Clone)]
pub struct BandwidthDetector {
    inner: Arc<Inner>,
}

impl BandwidthDetector {
    pub fn new(probe: Arc<dyn BandwidthProbe>, interval: Duration) -> Self {
        Self::build(Some(probe), interval, ConnectionQuality::Medium)
    }

    /// Detector pinned to `quality` with no probing.
    pub fn fixed(quality: ConnectionQuality) -> Self {
        Self::build(None, Duration::MAX, quality)
    }

    /// HTTP probe when a URL is configured, otherwise a fixed medium tier.
    pub fn from_config(config: &BandwidthConfig) -> Result<Self> {
        match &config.probe_url {
            Some(url) => {
                let probe = HttpBandwidthProbe::new(
                    url.clone(),
                    Duration::from_millis(config.probe_timeout_ms),
                )?;
                Ok(Self::new(
                    Arc::new(probe),
                    Duration::from_millis(config.interval_ms),
                ))
            }
            None => Ok(Self::fixed(ConnectionQuality::Medium)),
        }
    }

    fn build(
        probe: Option<Arc<dyn BandwidthProbe>>,
        interval: Duration,
        quality: ConnectionQuality,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                probe,
                interval,
                quality: Mutex::new(quality),
                task: Mutex::new(None),
            }),
        }
    }

    /// Probe once and update the current tier. Probe failures fall back to
    /// medium.
    pub async fn detect(&self) -> ConnectionQuality {
        let Some(probe) = self.inner.probe.clone() else {
            return self.quality();
        };
        let quality = match probe.probe().await {
            Ok(sample) => {
                let quality = sample.quality();
                tracing::debug!(
                    "Bandwidth probe: {} bytes in {:?} -> {quality}",
                    sample.bytes,
                    sample.elapsed
                );
                quality
            }
            Err(error) => {
                tracing::warn!("Bandwidth probe failed: {error}");
                ConnectionQuality::Medium
            }
        };
        *self.inner.quality.lock() = quality;
        quality
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.inner.quality.lock()
    }

    pub fn strategy(&self) -> SyncStrategy {
        SyncStrategy::for_quality(self.quality())
    }

    /// Probe now and then periodically until [`BandwidthDetector::stop`].
    pub fn start(&self) {
        if self.inner.probe.is_none() {
            return;
        }
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Self { inner }.detect().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedProbe {
        sample: Option<ProbeSample>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BandwidthProbe for FixedProbe {
        async fn probe(&self) -> Result<ProbeSample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sample
                .ok_or_else(|| Error::Network("probe unreachable".to_string()))
        }
    }

    fn probe(bytes: u64, millis: u64) -> Arc<FixedProbe> {
        Arc::new(FixedProbe {
            sample: Some(ProbeSample {
                bytes,
                elapsed: Duration::from_millis(millis),
            }),
            calls: AtomicU32::new(0),
        })
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(ConnectionQuality::from_mbps(0.5), ConnectionQuality::Slow);
        assert_eq!(ConnectionQuality::from_mbps(1.0), ConnectionQuality::Medium);
        assert_eq!(ConnectionQuality::from_mbps(9.9), ConnectionQuality::Medium);
        assert_eq!(ConnectionQuality::from_mbps(10.0), ConnectionQuality::Fast);
    }

    #[test]
    fn strategy_table() {
        let row = |quality| {
            let strategy = SyncStrategy::for_quality(quality);
            (strategy.batch_size, strategy.retry_delay.as_secs(), strategy.compression)
        };
        assert_eq!(row(ConnectionQuality::Slow), (2, 10, true));
        assert_eq!(row(ConnectionQuality::Medium), (5, 5, true));
        assert_eq!(row(ConnectionQuality::Fast), (20, 2, false));
    }

    #[tokio::test]
    async fn detect_classifies_samples() {
        // 50 KB in 1 s = 0.4 Mbps
        let detector = BandwidthDetector::new(probe(50_000, 1_000), Duration::from_secs(300));
        assert_eq!(detector.detect().await, ConnectionQuality::Slow);

        // 5 MB in 1 s = 40 Mbps
        let detector = BandwidthDetector::new(probe(5_000_000, 1_000), Duration::from_secs(300));
        assert_eq!(detector.detect().await, ConnectionQuality::Fast);
        assert!(!detector.strategy().compression);
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_medium() {
        let failing = Arc::new(FixedProbe {
            sample: None,
            calls: AtomicU32::new(0),
        });
        let detector = BandwidthDetector::new(failing, Duration::from_secs(300));
        assert_eq!(detector.detect().await, ConnectionQuality::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_probe_runs_until_stopped() {
        let probe = probe(5_000_000, 1_000);
        let detector = BandwidthDetector::new(probe.clone(), Duration::from_secs(300));
        detector.start();
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        detector.stop();
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(detector.quality(), ConnectionQuality::Fast);
    }

    #[test]
    fn zero_elapsed_counts_as_fast() {
        let sample = ProbeSample {
            bytes: 10,
            elapsed: Duration::ZERO,
        };
        assert_eq!(sample.quality(), ConnectionQuality::Fast);
    }
}
