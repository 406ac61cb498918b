//! Consensus engine: provider fan-out, aggregation, health and batch mode

use crate::aggregators::aggregate;
use crate::config::EngineSettings;
use crate::normalizers::normalize_signal;
use crate::observability::{metrics, MetricsCollector};
use crate::providers::{ProviderRegistry, RegisteredProvider};
use crate::types::*;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-request knobs. Defaults come from [`EngineSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOptions {
    /// Applied to every provider call independently
    pub timeout: Duration,
    pub min_confidence: f64,
    pub min_agreement: f64,
    /// Fewer valid signals than this fails the request
    pub min_providers: usize,
    /// Restrict the fan-out to these provider ids (priority order is kept)
    pub providers: Option<Vec<String>>,
    /// Per-provider weight overrides
    pub weights: HashMap<String, f64>,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl ConsensusOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            min_confidence: settings.min_confidence,
            min_agreement: settings.min_agreement,
            min_providers: settings.min_providers,
            providers: None,
            weights: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConsensusError::InvalidConfiguration(msg));

        if self.timeout.is_zero() {
            return invalid("timeout must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid(format!("min_confidence must be within [0, 1], got {}", self.min_confidence));
        }
        if !(0.0..=1.0).contains(&self.min_agreement) {
            return invalid(format!("min_agreement must be within [0, 1], got {}", self.min_agreement));
        }
        if self.min_providers == 0 {
            return invalid("min_providers must be at least 1".to_string());
        }
        for (id, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return invalid(format!("weight for {} must be finite and non-negative, got {}", id, weight));
            }
        }
        Ok(())
    }
}

/// Engine-wide health summary
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Providers not currently unavailable
    pub available_providers: usize,
    pub required_providers: usize,
    pub providers: BTreeMap<String, ProviderHealth>,
}

/// One entry of a batch run, in input order
#[derive(Debug, Clone)]
pub struct BatchPrediction {
    pub label: String,
    pub result: Result<ConsensusResult>,
}

/// Fans a market context out to every selected provider and aggregates the
/// validated answers into one decision
pub struct ConsensusEngine {
    registry: ProviderRegistry,
    defaults: ConsensusOptions,
    batch_max_concurrent: usize,
    metrics: MetricsCollector,
}

impl ConsensusEngine {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            defaults: ConsensusOptions::default(),
            batch_max_concurrent: EngineSettings::default().batch_max_concurrent,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registry from settings plus any `<VENDOR>_API_KEY` in the environment
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let registry = ProviderRegistry::from_settings(settings)?;
        Ok(Self::new(registry)
            .with_defaults(ConsensusOptions::from_settings(settings))
            .with_batch_concurrency(settings.batch_max_concurrent))
    }

    pub fn with_defaults(mut self, defaults: ConsensusOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_batch_concurrency(mut self, max_concurrent: usize) -> Self {
        self.batch_max_concurrent = max_concurrent;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProviderRegistry {
        &mut self.registry
    }

    pub fn defaults(&self) -> &ConsensusOptions {
        &self.defaults
    }

    pub fn batch_max_concurrent(&self) -> usize {
        self.batch_max_concurrent
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Consensus with the engine's default options
    pub async fn get_consensus(&self, context: &MarketContext) -> Result<ConsensusResult> {
        self.get_consensus_with(context, &self.defaults).await
    }

    pub async fn get_consensus_with(
        &self,
        context: &MarketContext,
        options: &ConsensusOptions,
    ) -> Result<ConsensusResult> {
        let started = Instant::now();
        self.metrics.increment(metrics::CONSENSUS_REQUESTS, 1).await;

        let outcome = self.run(context, options).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.histogram(metrics::CONSENSUS_DURATION_MS, elapsed_ms).await;

        match &outcome {
            Ok(result) => {
                self.metrics.increment(metrics::CONSENSUS_SUCCESS, 1).await;
                let decision_metric = match result.decision {
                    Decision::Buy => metrics::DECISION_BUY,
                    Decision::Sell => metrics::DECISION_SELL,
                    Decision::Hold => metrics::DECISION_HOLD,
                };
                self.metrics.increment(decision_metric, 1).await;
            }
            Err(e) => {
                self.metrics.increment(metrics::CONSENSUS_FAILED, 1).await;
                warn!(context = %context.label(), error = %e, "Consensus failed");
            }
        }

        outcome
    }

    async fn run(&self, context: &MarketContext, options: &ConsensusOptions) -> Result<ConsensusResult> {
        let selected = self.select(options)?;

        debug!(
            context = %context.label(),
            providers = ?selected.iter().map(|(p, _)| p.id()).collect::<Vec<_>>(),
            "Fanning out"
        );

        let timeout = options.timeout;
        let calls = selected.iter().map(move |(registered, _)| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, registered.provider.predict(context)).await {
                Ok(Ok(raw)) => normalize_signal(registered.id(), raw),
                Ok(Err(e)) => Err(e),
                // Dropping the call discards any late response
                Err(_) => Err(ProviderError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            (started.elapsed(), outcome)
        });

        // join_all keeps registration order, whatever order the calls finish in
        let results = futures::future::join_all(calls).await;

        let mut signals = Vec::with_capacity(results.len());
        let mut failures = Vec::new();

        for ((registered, _), (elapsed, outcome)) in selected.iter().zip(results) {
            self.metrics.increment(metrics::PROVIDER_CALLS, 1).await;
            match outcome {
                Ok(mut signal) => {
                    let measured_ms = elapsed.as_secs_f64() * 1000.0;
                    signal.latency_ms.get_or_insert(measured_ms);
                    registered.tracker.record_success(measured_ms as u64);
                    signals.push(signal);
                }
                Err(error) => {
                    warn!(provider = %registered.id(), kind = error.kind(), "Provider failed: {}", error);
                    registered.tracker.record_failure(&error);
                    self.metrics.increment(metrics::PROVIDER_FAILURES, 1).await;
                    self.metrics
                        .increment(&metrics::provider_failure(error.kind()), 1)
                        .await;
                    failures.push(ProviderFailure {
                        provider: registered.id().to_string(),
                        error,
                    });
                }
            }
        }

        if signals.is_empty() {
            return Err(ConsensusError::NoProvidersAvailable { failures });
        }
        if signals.len() < options.min_providers {
            return Err(ConsensusError::InsufficientProviders {
                required: options.min_providers,
                received: signals.len(),
                failures,
            });
        }

        let weights: HashMap<String, f64> = selected
            .iter()
            .map(|(registered, weight)| (registered.id().to_string(), *weight))
            .collect();

        let mut result = aggregate(&signals, &weights, selected.len())?;
        result.meets_thresholds =
            result.confidence >= options.min_confidence && result.agreement_score >= options.min_agreement;
        result.failures = failures;
        result.timestamp = Utc::now();

        info!(
            context = %context.label(),
            decision = %result.decision,
            confidence = result.confidence,
            agreement = result.agreement_score,
            participating = result.participating_providers,
            total = result.total_providers,
            meets_thresholds = result.meets_thresholds,
            "Consensus reached"
        );

        Ok(result)
    }

    /// Enabled providers for this request with their effective weights, in
    /// priority order. Zero-weight providers are left out; nothing is called
    /// if the configuration cannot produce a decision.
    fn select<'a>(&'a self, options: &ConsensusOptions) -> Result<Vec<(&'a RegisteredProvider, f64)>> {
        options.validate()?;

        for id in options.weights.keys() {
            if self.registry.get(id).is_none() {
                return Err(ConsensusError::InvalidConfiguration(format!(
                    "weight given for unknown provider {}",
                    id
                )));
            }
        }
        if let Some(requested) = &options.providers {
            for id in requested {
                if self.registry.get(id).is_none() {
                    return Err(ConsensusError::InvalidConfiguration(format!("unknown provider {}", id)));
                }
            }
        }

        let enabled: Vec<(&RegisteredProvider, f64)> = self
            .registry
            .enabled()
            .filter(|p| {
                options
                    .providers
                    .as_ref()
                    .map_or(true, |requested| requested.iter().any(|id| id == p.id()))
            })
            .map(|p| (p, options.weights.get(p.id()).copied().unwrap_or(p.weight)))
            .collect();

        if enabled.is_empty() {
            return Err(ConsensusError::InvalidConfiguration("no providers enabled".to_string()));
        }

        let selected: Vec<(&RegisteredProvider, f64)> =
            enabled.into_iter().filter(|(_, weight)| *weight > 0.0).collect();

        if selected.is_empty() {
            return Err(ConsensusError::InvalidConfiguration(
                "provider weights sum to zero".to_string(),
            ));
        }
        if selected.len() < options.min_providers {
            return Err(ConsensusError::InvalidConfiguration(format!(
                "min_providers is {} but only {} providers can be queried",
                options.min_providers,
                selected.len()
            )));
        }

        Ok(selected)
    }

    /// Health of every registered provider, keyed by id.
    ///
    /// Each entry is the worse of the provider's own report and what the
    /// engine observed (timeouts are only visible to the engine). Disabled
    /// providers report unavailable.
    pub async fn health_check(&self) -> BTreeMap<String, ProviderHealth> {
        let reports = futures::future::join_all(self.registry.iter().map(|p| p.provider.health())).await;

        self.registry
            .iter()
            .zip(reports)
            .map(|(registered, mut health)| {
                let observed = registered.tracker.snapshot(registered.id());

                health.provider = registered.id().to_string();
                health.status = health.status.max(observed.status);
                health.latency_ms = observed.latency_ms.or(health.latency_ms);
                health.last_success = health.last_success.max(observed.last_success);
                health.success_rate = health.success_rate.min(observed.success_rate);
                if health.last_error.is_none() {
                    health.last_error = observed.last_error;
                }

                if !registered.enabled {
                    health.status = HealthStatus::Unavailable;
                    health.last_error.get_or_insert_with(|| "disabled".to_string());
                }

                (registered.id().to_string(), health)
            })
            .collect()
    }

    /// Overall status: unavailable when fewer than `min_providers` can be
    /// reached, degraded when any reachable provider is not healthy
    pub async fn health_report(&self) -> HealthReport {
        let providers = self.health_check().await;
        let required = self.defaults.min_providers;

        let available = providers
            .values()
            .filter(|h| h.status != HealthStatus::Unavailable)
            .count();
        let all_healthy = providers
            .values()
            .filter(|h| h.status != HealthStatus::Unavailable)
            .all(|h| h.status == HealthStatus::Healthy);

        let status = if available < required || available == 0 {
            HealthStatus::Unavailable
        } else if all_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            available_providers: available,
            required_providers: required,
            providers,
        }
    }

    /// Consensus for several contexts, at most `max_concurrent` fan-outs in
    /// flight. Results come back in input order; one context failing does not
    /// fail the batch.
    pub async fn get_batch_predictions(
        &self,
        contexts: &[MarketContext],
        max_concurrent: usize,
    ) -> Result<Vec<BatchPrediction>> {
        self.get_batch_predictions_with(contexts, max_concurrent, &self.defaults)
            .await
    }

    pub async fn get_batch_predictions_with(
        &self,
        contexts: &[MarketContext],
        max_concurrent: usize,
        options: &ConsensusOptions,
    ) -> Result<Vec<BatchPrediction>> {
        if max_concurrent == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        // Configuration errors fail the whole batch before any call
        self.select(options)?;

        self.metrics.increment(metrics::BATCH_REQUESTS, 1).await;
        info!(contexts = contexts.len(), max_concurrent, "Starting batch");

        let in_flight = AtomicUsize::new(0);
        let pending: Vec<_> = contexts
            .iter()
            .map(|context| self.batch_one(context, options, &in_flight))
            .collect();

        let predictions = stream::iter(pending)
            .buffered(max_concurrent)
            .collect::<Vec<_>>()
            .await;

        Ok(predictions)
    }

    async fn batch_one(
        &self,
        context: &MarketContext,
        options: &ConsensusOptions,
        in_flight: &AtomicUsize,
    ) -> BatchPrediction {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.gauge(metrics::BATCH_IN_FLIGHT, now as f64).await;

        let result = self.get_consensus_with(context, options).await;

        let now = in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.gauge(metrics::BATCH_IN_FLIGHT, now as f64).await;

        BatchPrediction {
            label: context.label().to_string(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Fixed {
        id: &'static str,
        decision: &'static str,
        confidence: f64,
    }

    #[async_trait::async_trait]
    impl LlmProvider for Fixed {
        async fn predict(&self, _context: &MarketContext) -> ProviderResult<RawSignal> {
            Ok(RawSignal::new(self.decision, self.confidence))
        }

        async fn health(&self) -> ProviderHealth {
            crate::providers::HealthTracker::default().snapshot(self.id)
        }

        fn id(&self) -> &str {
            self.id
        }
    }

    fn engine(providers: &[(&'static str, &'static str, f64, f64)]) -> ConsensusEngine {
        let mut registry = ProviderRegistry::new();
        for (id, decision, confidence, weight) in providers {
            registry
                .register(
                    Arc::new(Fixed {
                        id: *id,
                        decision: *decision,
                        confidence: *confidence,
                    }),
                    *weight,
                )
                .unwrap();
        }
        ConsensusEngine::new(registry)
    }

    #[tokio::test]
    async fn test_zero_weight_provider_is_not_queried() {
        let engine = engine(&[("a", "BUY", 0.9, 1.0), ("b", "SELL", 0.9, 0.0)]);
        let result = engine
            .get_consensus(&MarketContext::trading_pair("BTC/USDT", "1h"))
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Buy);
        assert_eq!(result.participating_providers, 1);
        assert_eq!(result.total_providers, 1);
    }

    #[tokio::test]
    async fn test_weight_override_and_subset() {
        let engine = engine(&[("a", "BUY", 0.6, 1.0), ("b", "SELL", 0.6, 1.0), ("c", "HOLD", 0.1, 1.0)]);
        let ctx = MarketContext::trading_pair("SOL/USDT", "4h");

        let mut options = ConsensusOptions::default();
        options.weights.insert("b".to_string(), 2.0);
        assert_eq!(engine.get_consensus_with(&ctx, &options).await.unwrap().decision, Decision::Sell);

        let options = ConsensusOptions {
            providers: Some(vec!["a".to_string(), "c".to_string()]),
            ..Default::default()
        };
        let result = engine.get_consensus_with(&ctx, &options).await.unwrap();
        assert_eq!(result.decision, Decision::Buy);
        assert_eq!(result.total_providers, 2);
    }

    #[tokio::test]
    async fn test_meets_thresholds_never_changes_decision() {
        let engine = engine(&[("a", "BUY", 0.4, 1.0)]);
        let result = engine
            .get_consensus(&MarketContext::trading_pair("BTC/USDT", "1h"))
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Buy);
        assert!(!result.meets_thresholds);
        assert!(!result.is_actionable(0.5, 0.7));
        assert!(result.is_actionable(0.3, 0.7));
    }

    #[tokio::test]
    async fn test_invalid_configurations_fail_fast() {
        let ctx = MarketContext::trading_pair("BTC/USDT", "1h");

        let empty = ConsensusEngine::new(ProviderRegistry::new());
        assert!(matches!(
            empty.get_consensus(&ctx).await,
            Err(ConsensusError::InvalidConfiguration(_))
        ));

        let zero = engine(&[("a", "BUY", 0.9, 0.0), ("b", "BUY", 0.9, 0.0)]);
        assert!(matches!(
            zero.get_consensus(&ctx).await,
            Err(ConsensusError::InvalidConfiguration(_))
        ));

        let two = engine(&[("a", "BUY", 0.9, 1.0), ("b", "BUY", 0.9, 1.0)]);
        let options = ConsensusOptions {
            providers: Some(vec!["nope".to_string()]),
            ..Default::default()
        };
        assert!(two.get_consensus_with(&ctx, &options).await.is_err());

        let options = ConsensusOptions {
            min_agreement: 1.2,
            ..Default::default()
        };
        assert!(two.get_consensus_with(&ctx, &options).await.is_err());

        assert!(matches!(
            two.get_batch_predictions(&[ctx.clone()], 0).await,
            Err(ConsensusError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_provider_reports_unavailable() {
        let mut engine = engine(&[("a", "BUY", 0.9, 1.0), ("b", "BUY", 0.9, 1.0)]);
        assert!(engine.registry_mut().set_enabled("b", false));

        let health = engine.health_check().await;
        assert_eq!(health["a"].status, HealthStatus::Healthy);
        assert_eq!(health["b"].status, HealthStatus::Unavailable);

        let report = engine.health_report().await;
        assert_eq!(report.available_providers, 1);
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
