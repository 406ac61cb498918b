//! Engine configuration
//!
//! Loaded once at startup from an optional `consensus.toml` layered under
//! `CONSENSUS__*` environment variables, then validated before any provider
//! is built.

use crate::providers::ProviderKind;
use crate::types::ConsensusError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default config file, overridable with `CONSENSUS_CONFIG`
pub const DEFAULT_CONFIG_PATH: &str = "consensus.toml";

/// Every recognised engine option, with its default
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EngineSettings {
    /// Per-provider call timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,
    /// Fewer valid signals than this fails the request
    #[serde(default = "default_min_providers")]
    pub min_providers: usize,
    #[serde(default = "default_batch_max_concurrent")]
    pub batch_max_concurrent: usize,
    /// Latency budget before a provider is reported degraded
    #[serde(default = "default_healthy_latency_ms")]
    pub healthy_latency_ms: u64,
    #[serde(default = "default_degraded_success_rate")]
    pub degraded_success_rate: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Keyed by provider id (`anthropic`, `openai`, `gemini`, `grok`)
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_confidence: default_min_confidence(),
            min_agreement: default_min_agreement(),
            min_providers: default_min_providers(),
            batch_max_concurrent: default_batch_max_concurrent(),
            healthy_latency_ms: default_healthy_latency_ms(),
            degraded_success_rate: default_degraded_success_rate(),
            log_level: default_log_level(),
            bind_addr: default_bind_addr(),
            providers: BTreeMap::new(),
        }
    }
}

/// Per-vendor options. Unset fields fall back to the vendor defaults.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Falls back to `<VENDOR>_API_KEY`
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Falls back to the engine timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            api_key: None,
            model: None,
            base_url: None,
            weight: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

// Keys stay out of logs
impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("weight", &self.weight)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

fn default_timeout_secs() -> u64 { 30 }
fn default_min_confidence() -> f64 { 0.5 }
fn default_min_agreement() -> f64 { 0.7 }
fn default_min_providers() -> usize { 1 }
fn default_batch_max_concurrent() -> usize { 3 }
fn default_healthy_latency_ms() -> u64 { 10_000 }
fn default_degraded_success_rate() -> f64 { 0.8 }
fn default_log_level() -> String { "info".to_string() }
fn default_bind_addr() -> String { "0.0.0.0:8090".to_string() }
fn default_enabled() -> bool { true }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f64 { 0.7 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 1_000 }

impl EngineSettings {
    /// Load from `CONSENSUS_CONFIG` (or `consensus.toml`) plus environment
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONSENSUS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from an explicit file path (missing file is fine) plus environment
    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let settings: EngineSettings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CONSENSUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn provider_settings(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        self.providers.get(kind.id())
    }

    /// Reject anything the engine could only fail on later
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let invalid = |msg: String| Err(ConsensusError::InvalidConfiguration(msg));

        if self.timeout_secs == 0 {
            return invalid("timeout_secs must be positive".to_string());
        }
        for (name, value) in [
            ("min_confidence", self.min_confidence),
            ("min_agreement", self.min_agreement),
            ("degraded_success_rate", self.degraded_success_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.batch_max_concurrent == 0 {
            return invalid("batch_max_concurrent must be at least 1".to_string());
        }

        for (id, provider) in &self.providers {
            let kind: ProviderKind = id
                .parse()
                .map_err(ConsensusError::InvalidConfiguration)?;

            if let Some(weight) = provider.weight {
                if !weight.is_finite() || weight < 0.0 {
                    return invalid(format!("weight for {} must be finite and non-negative, got {}", id, weight));
                }
            }
            if provider.max_tokens == 0 {
                return invalid(format!("max_tokens for {} must be positive", id));
            }
            if provider.timeout_secs == Some(0) {
                return invalid(format!("timeout_secs for {} must be positive", id));
            }
            if let Some(base_url) = &provider.base_url {
                kind.validate_base_url(base_url)?;
            }
        }

        Ok(())
    }
}
