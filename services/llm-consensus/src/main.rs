use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use llm_consensus::{observability, ConsensusEngine, EngineSettings, HealthStatus};

/// Application state shared across handlers
pub struct AppState {
    pub engine: ConsensusEngine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = EngineSettings::load()?;
    observability::init_tracing(&settings.log_level);

    info!("Starting LLM Consensus Service...");

    let engine = ConsensusEngine::from_settings(&settings)?;

    let enabled: Vec<&str> = engine.registry().enabled().map(|p| p.id()).collect();
    if enabled.is_empty() {
        warn!("⚠ No providers enabled; set ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY or GROK_API_KEY");
    } else {
        info!("✓ Providers enabled: {}", enabled.join(", "));
    }

    let report = engine.health_report().await;
    if report.status == HealthStatus::Unavailable {
        warn!(
            "⚠ Only {} of {} required providers available",
            report.available_providers, report.required_providers
        );
    }

    let state = Arc::new(AppState { engine });

    // Build router
    let app = Router::new()
        .route("/consensus", post(handlers::get_consensus))
        .route("/consensus/batch", post(handlers::get_consensus_batch))
        .route("/sizing/kelly", post(handlers::kelly_sizing))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::get_metrics))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("🚀 LLM Consensus Service listening on {}", settings.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

mod handlers;
