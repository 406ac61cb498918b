use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Trading decision, from a single provider or from the consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    Sell,
    Hold,
}

impl Decision {
    pub const ALL: [Decision; 3] = [Decision::Buy, Decision::Sell, Decision::Hold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Sell => "SELL",
            Decision::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(Decision::Buy),
            "SELL" => Ok(Decision::Sell),
            "HOLD" => Ok(Decision::Hold),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

/// Risk level; ordering is Low < Medium < High
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// Question handed to every provider. The engine forwards it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketContext {
    /// Exchange pair plus whatever indicators the caller computed
    TradingPair {
        pair: String,
        timeframe: String,
        #[serde(default)]
        current_price: Option<f64>,
        #[serde(default)]
        indicators: serde_json::Map<String, serde_json::Value>,
    },
    /// Binary prediction market ("will X happen by Y?")
    PredictionMarket {
        question: String,
        /// Current probability of YES, in (0, 1)
        yes_price: f64,
        #[serde(default)]
        no_price: Option<f64>,
        #[serde(default)]
        volume_24h: Option<f64>,
        #[serde(default)]
        days_to_expiration: Option<f64>,
        #[serde(default)]
        expiration_date: Option<String>,
        #[serde(default)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

impl MarketContext {
    pub fn trading_pair(pair: impl Into<String>, timeframe: impl Into<String>) -> Self {
        MarketContext::TradingPair {
            pair: pair.into(),
            timeframe: timeframe.into(),
            current_price: None,
            indicators: serde_json::Map::new(),
        }
    }

    pub fn prediction_market(question: impl Into<String>, yes_price: f64) -> Self {
        MarketContext::PredictionMarket {
            question: question.into(),
            yes_price,
            no_price: None,
            volume_24h: None,
            days_to_expiration: None,
            expiration_date: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Pair or market question, used to key batch results and log lines
    pub fn label(&self) -> &str {
        match self {
            MarketContext::TradingPair { pair, .. } => pair,
            MarketContext::PredictionMarket { question, .. } => question,
        }
    }
}

/// Payload as returned by a provider, before validation.
///
/// Loosely typed on purpose: LLMs return confidences as strings, prices as
/// strings, risk levels in any case. `normalizers::normalize_signal` turns
/// this into a [`Signal`] or rejects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub confidence: Option<serde_json::Value>,
    #[serde(default)]
    pub reasoning: Option<serde_json::Value>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub suggested_stop_loss: Option<serde_json::Value>,
    #[serde(default)]
    pub suggested_take_profit: Option<serde_json::Value>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

impl RawSignal {
    pub fn new(decision: &str, confidence: f64) -> Self {
        Self {
            decision: Some(decision.to_string()),
            confidence: Some(serde_json::json!(confidence)),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = Some(serde_json::Value::String(reasoning.to_string()));
        self
    }

    pub fn with_risk_level(mut self, risk: &str) -> Self {
        self.risk_level = Some(risk.to_string());
        self
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.suggested_stop_loss = Some(serde_json::json!(stop_loss));
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.suggested_take_profit = Some(serde_json::json!(take_profit));
        self
    }

    pub fn with_telemetry(mut self, latency_ms: f64, cost_usd: Option<f64>, tokens_used: Option<u64>) -> Self {
        self.latency_ms = Some(latency_ms);
        self.cost_usd = cost_usd;
        self.tokens_used = tokens_used;
        self
    }
}

/// One provider's validated opinion for a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub provider_id: String,
    pub decision: Decision,
    /// Clamped to [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// A provider call that was absorbed during fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

/// Aggregated decision across all participating providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub decision: Decision,
    /// Weighted confidence behind the winning decision, in [0, 1]
    pub confidence: f64,
    /// Share of participating weight that voted for the winner, in [0, 1]
    pub agreement_score: f64,
    pub vote_breakdown: BTreeMap<Decision, usize>,
    pub weighted_vote_breakdown: BTreeMap<Decision, f64>,
    pub participating_providers: usize,
    pub total_providers: usize,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    pub suggested_stop_loss: Option<f64>,
    pub suggested_take_profit: Option<f64>,
    /// Slowest participating provider (calls run concurrently)
    pub total_latency_ms: Option<f64>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    /// Whether confidence and agreement reach the request's thresholds.
    /// Informational only: the decision is never changed by it.
    pub meets_thresholds: bool,
    pub signals: Vec<Signal>,
    pub failures: Vec<ProviderFailure>,
    pub timestamp: DateTime<Utc>,
}

impl ConsensusResult {
    /// Caller-side admission check. HOLD is never actionable.
    pub fn is_actionable(&self, min_confidence: f64, min_agreement: f64) -> bool {
        self.decision != Decision::Hold
            && self.confidence >= min_confidence
            && self.agreement_score >= min_agreement
    }
}

/// Provider health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// Provider health/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
}

/// Failure of a single provider call. Always absorbed by the fan-out.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limit exceeded")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("provider not configured: {reason}")]
    NotConfigured { reason: String },
}

impl ProviderError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProviderError::MalformedResponse { reason: reason.into() }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. }
            | ProviderError::RateLimit { .. }
            | ProviderError::Transport { .. }
            | ProviderError::MalformedResponse { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Authentication { .. } | ProviderError::NotConfigured { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::MalformedResponse { .. } => "malformed_response",
            ProviderError::Api { .. } => "api",
            ProviderError::RateLimit { .. } => "rate_limit",
            ProviderError::Authentication { .. } => "authentication",
            ProviderError::Transport { .. } => "transport",
            ProviderError::NotConfigured { .. } => "not_configured",
        }
    }
}

/// Request-level failure surfaced to the caller
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsensusError {
    #[error("no providers available ({} failed)", .failures.len())]
    NoProvidersAvailable { failures: Vec<ProviderFailure> },

    #[error("insufficient providers: {received} responded, {required} required")]
    InsufficientProviders {
        required: usize,
        received: usize,
        failures: Vec<ProviderFailure>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ConsensusError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusError::NoProvidersAvailable { .. } => "no_providers_available",
            ConsensusError::InsufficientProviders { .. } => "insufficient_providers",
            ConsensusError::InvalidConfiguration(_) => "invalid_configuration",
        }
    }

    /// Provider failures behind the error, if any
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            ConsensusError::NoProvidersAvailable { failures }
            | ConsensusError::InsufficientProviders { failures, .. } => failures,
            ConsensusError::InvalidConfiguration(_) => &[],
        }
    }
}

/// Result type for single provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Trait for LLM signal providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Ask the provider for a trading signal
    async fn predict(&self, context: &MarketContext) -> ProviderResult<RawSignal>;

    /// Get provider health status
    async fn health(&self) -> ProviderHealth;

    /// Provider identifier
    fn id(&self) -> &str;
}
