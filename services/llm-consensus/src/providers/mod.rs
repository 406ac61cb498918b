//! LLM signal providers
//!
//! The set of vendors is closed ([`ProviderKind`]); each is built into an
//! `Arc<dyn LlmProvider>` and registered, in priority order, into a
//! [`ProviderRegistry`] keyed by provider id.

pub mod anthropic;
pub mod gemini;
pub mod health;
pub mod openai;
pub mod prompt;
pub mod transport;

pub use health::{HealthThresholds, HealthTracker};
pub use transport::RetryPolicy;

use crate::config::{EngineSettings, ProviderSettings};
use crate::types::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// USD per million (input, output) tokens
pub static PRICING: phf::Map<&'static str, (f64, f64)> = phf::phf_map! {
    "claude-3-5-sonnet" => (3.0, 15.0),
    "claude-3-opus" => (15.0, 75.0),
    "claude-3-sonnet" => (3.0, 15.0),
    "claude-3-haiku" => (0.25, 1.25),
    "gpt-4-turbo" => (10.0, 30.0),
    "gpt-4" => (30.0, 60.0),
    "gpt-4o" => (5.0, 15.0),
    "gpt-4o-mini" => (0.15, 0.6),
    "gpt-3.5-turbo" => (0.5, 1.5),
    "gemini-1.5-pro" => (3.5, 10.5),
    "gemini-1.5-flash" => (0.35, 1.05),
    "gemini-1.0-pro" => (0.5, 1.5),
    "grok-beta" => (5.0, 15.0),
    "grok-vision-beta" => (5.0, 15.0),
};

/// Exact entry, else the longest pricing key the model name starts with
fn pricing_for(model: &str) -> Option<(f64, f64)> {
    if let Some(price) = PRICING.get(model) {
        return Some(*price);
    }
    PRICING
        .entries()
        .filter(|(key, _)| model.starts_with(*key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, price)| *price)
}

/// Estimated call cost in USD, rounded to 6 decimals.
///
/// Unknown models are priced as `fallback_model`.
pub fn estimate_cost(model: &str, fallback_model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    let (input_price, output_price) = pricing_for(model).or_else(|| pricing_for(fallback_model))?;
    let cost = (input_tokens as f64 * input_price + output_tokens as f64 * output_price) / 1_000_000.0;
    Some((cost * 1e6).round() / 1e6)
}

/// Input plus output tokens; vendor-reported counts are not trusted to be small
fn tokens_used(input: Option<u64>, output: Option<u64>) -> Option<u64> {
    match (input, output) {
        (None, None) => None,
        (input, output) => Some(input.unwrap_or(0).saturating_add(output.unwrap_or(0))),
    }
}

/// Supported vendors, in default priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
    Grok,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Gemini,
        ProviderKind::Grok,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Grok => "grok",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => anthropic::DEFAULT_MODEL,
            ProviderKind::OpenAi => openai::OPENAI_DEFAULT_MODEL,
            ProviderKind::Gemini => gemini::DEFAULT_MODEL,
            ProviderKind::Grok => openai::GROK_DEFAULT_MODEL,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => anthropic::DEFAULT_BASE_URL,
            ProviderKind::OpenAi => openai::OPENAI_BASE_URL,
            ProviderKind::Gemini => gemini::DEFAULT_BASE_URL,
            ProviderKind::Grok => openai::GROK_BASE_URL,
        }
    }

    pub fn default_weight(&self) -> f64 {
        match self {
            ProviderKind::Anthropic | ProviderKind::OpenAi => 1.0,
            ProviderKind::Gemini => 0.8,
            ProviderKind::Grok => 0.7,
        }
    }

    /// Conventional environment variable holding the vendor key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Grok => "GROK_API_KEY",
        }
    }

    pub fn validate_base_url(&self, base_url: &str) -> Result<()> {
        let parsed = url::Url::parse(base_url).map_err(|e| {
            ConsensusError::InvalidConfiguration(format!("invalid base_url for {}: {}", self.id(), e))
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConsensusError::InvalidConfiguration(format!(
                "base_url for {} must be http(s), got {}",
                self.id(),
                other
            ))),
        }
    }

    /// Resolve client options from settings, falling back to vendor defaults
    pub fn options(
        &self,
        settings: &ProviderSettings,
        api_key: Option<String>,
        engine: &EngineSettings,
    ) -> Result<ClientOptions> {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| self.default_base_url().to_string());
        self.validate_base_url(&base_url)?;

        Ok(ClientOptions {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            pricing_model: self.default_model().to_string(),
            base_url,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                backoff_ms: settings.retry_backoff_ms,
            },
            request_timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(engine.timeout_secs)),
            health: HealthThresholds {
                latency_budget_ms: engine.healthy_latency_ms,
                degraded_success_rate: engine.degraded_success_rate,
            },
        })
    }

    pub fn build(&self, options: ClientOptions) -> Arc<dyn LlmProvider> {
        match self {
            ProviderKind::Anthropic => Arc::new(anthropic::AnthropicProvider::new(self.id(), options)),
            ProviderKind::OpenAi | ProviderKind::Grok => {
                Arc::new(openai::OpenAiCompatibleProvider::new(self.id(), options))
            }
            ProviderKind::Gemini => Arc::new(gemini::GeminiProvider::new(self.id(), options)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "grok" | "xai" => Ok(ProviderKind::Grok),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Everything an HTTP provider needs to talk to its vendor
#[derive(Clone)]
pub struct ClientOptions {
    pub api_key: Option<String>,
    pub model: String,
    /// Priced as this model when `model` is missing from [`PRICING`]
    pub pricing_model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub health: HealthThresholds,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Reply text plus token usage from one vendor call
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Vendor-specific request/response shape behind an [`HttpProvider`]
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync + Sized {
    fn from_options(id: &str, options: &ClientOptions) -> Self;

    async fn complete(&self, options: &ClientOptions, api_key: &str, prompt: &str) -> ProviderResult<Completion>;
}

/// Prompt in, signal out: the vendor-independent half of every HTTP provider
pub struct HttpProvider<B> {
    id: String,
    options: ClientOptions,
    backend: B,
    tracker: HealthTracker,
}

impl<B: ChatBackend> HttpProvider<B> {
    pub fn new(id: &str, options: ClientOptions) -> Self {
        let backend = B::from_options(id, &options);
        info!(provider = %id, model = %options.model, configured = options.api_key.is_some(), "Initialized provider");
        Self {
            id: id.to_string(),
            tracker: HealthTracker::new(options.health),
            options,
            backend,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

#[async_trait::async_trait]
impl<B: ChatBackend> LlmProvider for HttpProvider<B> {
    async fn predict(&self, context: &MarketContext) -> ProviderResult<RawSignal> {
        let api_key = self.options.api_key.as_deref().ok_or_else(|| ProviderError::NotConfigured {
            reason: "missing API key".to_string(),
        })?;

        let prompt = prompt::build_prompt(context);
        let start = Instant::now();

        let outcome: ProviderResult<(Completion, RawSignal)> = async {
            let completion = self.backend.complete(&self.options, api_key, &prompt).await?;
            let raw = prompt::parse_signal_text(&completion.text)?;
            Ok((completion, raw))
        }
        .await;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok((completion, raw)) => {
                self.tracker.record_success(latency_ms as u64);

                let cost_usd = match (completion.input_tokens, completion.output_tokens) {
                    (Some(input), Some(output)) => {
                        estimate_cost(&self.options.model, &self.options.pricing_model, input, output)
                    }
                    _ => None,
                };
                let tokens_used = tokens_used(completion.input_tokens, completion.output_tokens);

                debug!(provider = %self.id, latency_ms, ?tokens_used, "Signal received");
                Ok(raw.with_telemetry(latency_ms, cost_usd, tokens_used))
            }
            Err(e) => {
                self.tracker.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn health(&self) -> ProviderHealth {
        if self.options.api_key.is_none() {
            return ProviderHealth {
                provider: self.id.clone(),
                status: HealthStatus::Unavailable,
                latency_ms: None,
                last_success: None,
                last_error: Some("missing API key".to_string()),
                success_rate: 0.0,
            };
        }
        self.tracker.snapshot(&self.id)
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// A provider as seen by the engine
#[derive(Clone)]
pub struct RegisteredProvider {
    pub provider: Arc<dyn LlmProvider>,
    pub weight: f64,
    pub enabled: bool,
    /// Outcomes observed by the engine, including timeouts the provider never saw
    pub tracker: Arc<HealthTracker>,
}

impl RegisteredProvider {
    pub fn id(&self) -> &str {
        self.provider.id()
    }
}

/// Providers keyed by id, iterated in registration (priority) order
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
    thresholds: HealthThresholds,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: HealthThresholds) -> Self {
        Self {
            providers: Vec::new(),
            thresholds,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>, weight: f64) -> Result<()> {
        self.register_with(provider, weight, true)
    }

    pub fn register_with(&mut self, provider: Arc<dyn LlmProvider>, weight: f64, enabled: bool) -> Result<()> {
        let id = provider.id().to_string();
        if id.is_empty() {
            return Err(ConsensusError::InvalidConfiguration("provider id must not be empty".to_string()));
        }
        if self.get(&id).is_some() {
            return Err(ConsensusError::InvalidConfiguration(format!(
                "provider {} registered twice",
                id
            )));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(ConsensusError::InvalidConfiguration(format!(
                "weight for {} must be finite and non-negative, got {}",
                id, weight
            )));
        }

        debug!(provider = %id, weight, enabled, "Registered provider");
        self.providers.push(RegisteredProvider {
            provider,
            weight,
            enabled,
            tracker: Arc::new(HealthTracker::new(self.thresholds)),
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Returns false if no provider has this id
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.providers.iter_mut().find(|p| p.provider.id() == id) {
            Some(p) => {
                p.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build every vendor in priority order. Vendors without an API key (in
    /// settings or `<VENDOR>_API_KEY`) are registered disabled so health
    /// checks still list them as unavailable.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        settings.validate()?;

        let mut registry = Self::with_thresholds(HealthThresholds {
            latency_budget_ms: settings.healthy_latency_ms,
            degraded_success_rate: settings.degraded_success_rate,
        });

        for kind in ProviderKind::ALL {
            let explicit = settings.provider_settings(kind);
            let env_key = std::env::var(kind.api_key_env())
                .ok()
                .filter(|k| !k.trim().is_empty());

            let provider_settings = explicit.cloned().unwrap_or_default();
            let api_key = provider_settings.api_key.clone().or(env_key);
            let options = kind.options(&provider_settings, api_key, settings)?;
            let configured = options.api_key.is_some();

            if !configured && explicit.is_some() {
                warn!(provider = %kind, "No API key ({} unset), registering disabled", kind.api_key_env());
            } else if !configured {
                debug!(provider = %kind, "No API key ({} unset), registering disabled", kind.api_key_env());
            }

            registry.register_with(
                kind.build(options),
                provider_settings.weight.unwrap_or_else(|| kind.default_weight()),
                provider_settings.enabled && configured,
            )?;
        }

        info!(providers = ?registry.ids(), "Provider registry ready");
        Ok(registry)
    }
}
