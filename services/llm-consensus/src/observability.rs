//! Observability: metrics collection and structured logging

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::Level;

/// Samples kept per histogram; older samples are dropped first
const HISTOGRAM_WINDOW: usize = 1_000;

/// Install the global `tracing` subscriber.
///
/// Unknown level names fall back to `info`. Safe to call more than once.
pub fn init_tracing(level: &str) {
    let max_level = level.parse::<Level>().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt().with_max_level(max_level).try_init();
    if !level.eq_ignore_ascii_case(max_level.as_str()) {
        tracing::warn!(requested = %level, "Unknown log level, using info");
    }
}

/// In-process metrics for the consensus engine
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, VecDeque<f64>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                histograms: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record a histogram value
    pub async fn histogram(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        let samples = inner.histograms.entry(name.to_string()).or_default();
        if samples.len() >= HISTOGRAM_WINDOW {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    /// Get all metrics as JSON-serializable format
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;

        let requests = inner.counters.get(metrics::CONSENSUS_REQUESTS).copied().unwrap_or(0);
        let successes = inner.counters.get(metrics::CONSENSUS_SUCCESS).copied().unwrap_or(0);

        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms: inner
                .histograms
                .iter()
                .filter_map(|(name, samples)| HistogramSummary::from_samples(samples).map(|s| (name.clone(), s)))
                .collect(),
            success_rate: if requests == 0 {
                1.0
            } else {
                successes as f64 / requests as f64
            },
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    /// Get specific counter
    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    /// Successful consensus requests over all requests
    pub success_rate: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &VecDeque<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let rank = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];

        Some(Self {
            count: sorted.len(),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: rank(0.5),
            p95: rank(0.95),
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Predefined metric names
pub mod metrics {
    // Consensus requests
    pub const CONSENSUS_REQUESTS: &str = "consensus_requests_total";
    pub const CONSENSUS_SUCCESS: &str = "consensus_success_total";
    pub const CONSENSUS_FAILED: &str = "consensus_failed_total";
    pub const CONSENSUS_DURATION_MS: &str = "consensus_duration_ms";

    // Decisions
    pub const DECISION_BUY: &str = "decision_buy_total";
    pub const DECISION_SELL: &str = "decision_sell_total";
    pub const DECISION_HOLD: &str = "decision_hold_total";

    // Providers
    pub const PROVIDER_CALLS: &str = "provider_calls_total";
    pub const PROVIDER_FAILURES: &str = "provider_failures_total";
    /// Suffixed with the error kind, e.g. `provider_failures_timeout_total`
    pub const PROVIDER_FAILURE_PREFIX: &str = "provider_failures_";

    // Batch
    pub const BATCH_REQUESTS: &str = "batch_requests_total";
    pub const BATCH_IN_FLIGHT: &str = "batch_in_flight";

    pub fn provider_failure(kind: &str) -> String {
        format!("{}{}_total", PROVIDER_FAILURE_PREFIX, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_success_rate() {
        let collector = MetricsCollector::new();
        collector.increment(metrics::CONSENSUS_REQUESTS, 4).await;
        collector.increment(metrics::CONSENSUS_SUCCESS, 3).await;
        collector.increment(&metrics::provider_failure("timeout"), 1).await;

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.success_rate, 0.75);
        assert_eq!(collector.get_counter("provider_failures_timeout_total").await, 1);
        assert_eq!(collector.get_counter("missing").await, 0);
    }

    #[tokio::test]
    async fn test_histogram_summary() {
        let collector = MetricsCollector::new();
        for v in 1..=100 {
            collector.histogram(metrics::CONSENSUS_DURATION_MS, v as f64).await;
        }
        collector.gauge(metrics::BATCH_IN_FLIGHT, 2.0).await;

        let snapshot = collector.snapshot().await;
        let summary = snapshot.histograms[metrics::CONSENSUS_DURATION_MS];
        assert_eq!(summary.count, 100);
        assert_eq!(summary.max, 100.0);
        assert!((summary.mean - 50.5).abs() < 1e-9);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 51.0);
        assert!(summary.p95 >= 94.0 && summary.p95 <= 96.0);
        assert_eq!(snapshot.gauges[metrics::BATCH_IN_FLIGHT], 2.0);
    }

    #[tokio::test]
    async fn test_histogram_keeps_latest_window() {
        let collector = MetricsCollector::new();
        for v in 1..=1_500 {
            collector.histogram(metrics::CONSENSUS_DURATION_MS, v as f64).await;
        }

        let snapshot = collector.snapshot().await;
        let summary = &snapshot.histograms[metrics::CONSENSUS_DURATION_MS];
        assert_eq!(summary.count, HISTOGRAM_WINDOW);
        assert_eq!(summary.max, 1_500.0);
        // Samples 501..=1500 remain
        assert!((summary.mean - 1_000.5).abs() < 1e-9);
    }
}
