use axum::{extract::State, http::StatusCode, Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::AppState;
use llm_consensus::{
    sizing::{DEFAULT_KELLY_FRACTION, DEFAULT_MAX_STAKE_PER_MARKET},
    ConsensusError, ConsensusOptions, ConsensusResult, HealthReport, KellySizing, MarketContext,
    MetricsSnapshot, ProviderFailure,
};

/// Per-request overrides; anything omitted uses the engine defaults
#[derive(Debug, Default, serde::Deserialize)]
pub struct RequestOptions {
    pub timeout_ms: Option<u64>,
    pub min_confidence: Option<f64>,
    pub min_agreement: Option<f64>,
    pub min_providers: Option<usize>,
    pub providers: Option<Vec<String>>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

impl RequestOptions {
    fn apply(self, defaults: &ConsensusOptions) -> ConsensusOptions {
        ConsensusOptions {
            timeout: self.timeout_ms.map(Duration::from_millis).unwrap_or(defaults.timeout),
            min_confidence: self.min_confidence.unwrap_or(defaults.min_confidence),
            min_agreement: self.min_agreement.unwrap_or(defaults.min_agreement),
            min_providers: self.min_providers.unwrap_or(defaults.min_providers),
            providers: self.providers.or_else(|| defaults.providers.clone()),
            weights: if self.weights.is_empty() {
                defaults.weights.clone()
            } else {
                self.weights
            },
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ConsensusRequest {
    pub context: MarketContext,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, serde::Deserialize)]
pub struct BatchRequest {
    pub contexts: Vec<MarketContext>,
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, serde::Deserialize)]
pub struct KellyRequest {
    pub market_price: f64,
    pub win_probability: f64,
    pub kelly_fraction: Option<f64>,
    pub max_stake_per_market: Option<f64>,
}

/// Error body for failed consensus requests
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProviderFailure>,
}

impl From<&ConsensusError> for ErrorResponse {
    fn from(e: &ConsensusError) -> Self {
        Self {
            error: e.kind().to_string(),
            message: e.to_string(),
            failures: e.failures().to_vec(),
        }
    }
}

/// 503 when providers could not answer, 400 when the request or
/// configuration can never succeed
fn status_for(e: &ConsensusError) -> StatusCode {
    match e {
        ConsensusError::NoProvidersAvailable { .. } | ConsensusError::InsufficientProviders { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ConsensusError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
    }
}

fn error_reply(e: ConsensusError) -> (StatusCode, Json<ErrorResponse>) {
    (status_for(&e), Json(ErrorResponse::from(&e)))
}

/// POST /consensus - Aggregate one context across all providers
pub async fn get_consensus(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConsensusRequest>,
) -> Result<Json<ConsensusResult>, (StatusCode, Json<ErrorResponse>)> {
    info!("Consensus requested for {}", req.context.label());

    let options = req.options.apply(state.engine.defaults());
    state
        .engine
        .get_consensus_with(&req.context, &options)
        .await
        .map(Json)
        .map_err(|e| {
            warn!("Consensus error for {}: {}", req.context.label(), e);
            error_reply(e)
        })
}

#[derive(Debug, serde::Serialize)]
pub struct BatchEntry {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConsensusResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

#[derive(Debug, serde::Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchEntry>,
    pub succeeded: usize,
    pub failed: usize,
}

/// POST /consensus/batch - Several contexts, bounded concurrency
pub async fn get_consensus_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let max_concurrent = req.max_concurrent.unwrap_or(state.engine.batch_max_concurrent());
    let options = req.options.apply(state.engine.defaults());

    let predictions = state
        .engine
        .get_batch_predictions_with(&req.contexts, max_concurrent, &options)
        .await
        .map_err(error_reply)?;

    let results: Vec<BatchEntry> = predictions
        .into_iter()
        .map(|p| match p.result {
            Ok(result) => BatchEntry {
                label: p.label,
                result: Some(result),
                error: None,
            },
            Err(e) => BatchEntry {
                label: p.label,
                result: None,
                error: Some(ErrorResponse::from(&e)),
            },
        })
        .collect();

    let succeeded = results.iter().filter(|r| r.result.is_some()).count();
    let failed = results.len() - succeeded;

    Ok(Json(BatchResponse {
        results,
        succeeded,
        failed,
    }))
}

/// GET /health - Provider health; 503 when too few providers are reachable
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.engine.health_report().await;
    let status = match report.status {
        llm_consensus::HealthStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

/// GET /metrics - In-process counters and latency summaries
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().snapshot().await)
}

#[derive(Debug, serde::Serialize)]
pub struct KellyResponse {
    #[serde(flatten)]
    pub sizing: KellySizing,
    pub inputs: BTreeMap<&'static str, f64>,
}

/// POST /sizing/kelly - Kelly stake for a binary market
pub async fn kelly_sizing(Json(req): Json<KellyRequest>) -> Json<KellyResponse> {
    let kelly_fraction = req.kelly_fraction.unwrap_or(DEFAULT_KELLY_FRACTION);
    let max_stake = req.max_stake_per_market.unwrap_or(DEFAULT_MAX_STAKE_PER_MARKET);

    let sizing = llm_consensus::kelly_stake(req.market_price, req.win_probability, kelly_fraction, max_stake);

    let inputs = BTreeMap::from([
        ("market_price", req.market_price),
        ("win_probability", req.win_probability),
        ("kelly_fraction", kelly_fraction),
        ("max_stake_per_market", max_stake),
    ]);

    Json(KellyResponse { sizing, inputs })
}
