use crate::types::{HealthStatus, ProviderError, ProviderHealth};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

const OUTCOME_NONE: u8 = 0;
const OUTCOME_SUCCESS: u8 = 1;
const OUTCOME_FAILURE: u8 = 2;

/// Cutoffs used to classify a provider from its call history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Last call slower than this marks the provider degraded
    pub latency_budget_ms: u64,
    /// Success rate below this marks the provider degraded
    pub degraded_success_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            latency_budget_ms: 10_000,
            degraded_success_rate: 0.8,
        }
    }
}

/// Lock-free record of a provider's recent calls.
///
/// Status is derived from recorded outcomes only, so reporting health never
/// costs an API call.
#[derive(Debug)]
pub struct HealthTracker {
    thresholds: HealthThresholds,
    /// Timestamp of last successful call (millis since epoch)
    last_success_ms: AtomicU64,
    /// Timestamp of last failed call (millis since epoch)
    last_failure_ms: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// Latency of the last successful call in ms
    last_latency_ms: AtomicU64,
    last_outcome: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            last_outcome: AtomicU8::new(OUTCOME_NONE),
            last_error: Mutex::new(None),
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    pub fn record_success(&self, latency_ms: u64) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.last_outcome.store(OUTCOME_SUCCESS, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &ProviderError) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_outcome.store(OUTCOME_FAILURE, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn success_rate(&self) -> f64 {
        let successes = self.success_count.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            return 1.0; // No calls yet
        }
        successes as f64 / total as f64
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        match self.last_success_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms as i64),
        }
    }

    pub fn last_latency_ms(&self) -> Option<u64> {
        if self.success_count.load(Ordering::Relaxed) == 0 {
            None
        } else {
            Some(self.last_latency_ms.load(Ordering::Relaxed))
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Unavailable when the last call failed, degraded when slow or flaky,
    /// healthy otherwise (including before the first call)
    pub fn status(&self) -> HealthStatus {
        if self.last_outcome.load(Ordering::Relaxed) == OUTCOME_FAILURE {
            return HealthStatus::Unavailable;
        }

        let slow = self
            .last_latency_ms()
            .map(|ms| ms > self.thresholds.latency_budget_ms)
            .unwrap_or(false);

        if slow || self.success_rate() < self.thresholds.degraded_success_rate {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn snapshot(&self, provider: &str) -> ProviderHealth {
        let status = self.status();
        ProviderHealth {
            provider: provider.to_string(),
            status,
            latency_ms: self.last_latency_ms(),
            last_success: self.last_success(),
            last_error: if status == HealthStatus::Healthy {
                None
            } else {
                self.last_error()
            },
            success_rate: self.success_rate(),
        }
    }
}
