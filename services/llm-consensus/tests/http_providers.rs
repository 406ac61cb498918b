//! Vendor HTTP providers against wiremock stand-ins for the real APIs

use llm_consensus::{
    ConsensusEngine, Decision, EngineSettings, HealthStatus, LlmProvider, MarketContext,
    ProviderError, ProviderKind, ProviderRegistry, ProviderSettings,
};
use serde_json::json;
use std::sync::Arc;
use tokio_test::assert_ok;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SIGNAL_JSON: &str = r#"{"decision": "BUY", "confidence": 0.82, "reasoning": "RSI recovering from oversold", "risk_level": "low", "suggested_stop_loss": 41000, "suggested_take_profit": 46000}"#;

fn provider(kind: ProviderKind, server: &MockServer, max_retries: u32) -> Arc<dyn LlmProvider> {
    let settings = ProviderSettings {
        base_url: Some(server.uri()),
        max_retries,
        retry_backoff_ms: 0,
        timeout_secs: Some(5),
        ..Default::default()
    };
    let options = kind
        .options(&settings, Some("test-key".to_string()), &EngineSettings::default())
        .unwrap();
    kind.build(options)
}

fn btc() -> MarketContext {
    MarketContext::trading_pair("BTC/USDT", "1h")
}

fn chat_completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500 }
    })
}

#[tokio::test]
async fn test_openai_signal_with_usage_and_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "gpt-4-turbo" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion(&format!("```json\n{}\n```", SIGNAL_JSON))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let openai = provider(ProviderKind::OpenAi, &server, 0);
    let raw = assert_ok!(openai.predict(&btc()).await);

    assert_eq!(raw.decision.as_deref(), Some("BUY"));
    assert_eq!(raw.tokens_used, Some(1500));
    // 1000 × $10/M + 500 × $30/M
    assert!((raw.cost_usd.unwrap() - 0.025).abs() < 1e-9);
    assert!(raw.latency_ms.is_some());

    let signal = llm_consensus::normalize_signal(openai.id(), raw).unwrap();
    assert_eq!(signal.suggested_stop_loss, Some(41000.0));
    assert_eq!(openai.health().await.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_grok_uses_openai_compatible_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "grok-beta" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(SIGNAL_JSON)))
        .expect(1)
        .mount(&server)
        .await;

    let grok = provider(ProviderKind::Grok, &server, 0);
    assert_eq!(grok.id(), "grok");
    let raw = assert_ok!(grok.predict(&btc()).await);
    // grok-beta: $5/M in, $15/M out
    assert!((raw.cost_usd.unwrap() - 0.0125).abs() < 1e-9);
}

#[tokio::test]
async fn test_anthropic_messages_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": format!("Here is my analysis:\n{}", SIGNAL_JSON) }],
            "usage": { "input_tokens": 800, "output_tokens": 200 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let anthropic = provider(ProviderKind::Anthropic, &server, 0);
    let raw = assert_ok!(anthropic.predict(&btc()).await);

    assert_eq!(raw.risk_level.as_deref(), Some("low"));
    assert_eq!(raw.tokens_used, Some(1000));
    // 800 × $3/M + 200 × $15/M
    assert!((raw.cost_usd.unwrap() - 0.0054).abs() < 1e-9);
}

#[tokio::test]
async fn test_gemini_generate_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-pro:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": SIGNAL_JSON }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 600, "candidatesTokenCount": 100, "totalTokenCount": 700 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gemini = provider(ProviderKind::Gemini, &server, 0);
    let raw = assert_ok!(gemini.predict(&btc()).await);

    assert_eq!(raw.tokens_used, Some(700));
    assert_eq!(raw.confidence, Some(json!(0.82)));
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error": "invalid api key"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let openai = provider(ProviderKind::OpenAi, &server, 3);
    let err = openai.predict(&btc()).await.unwrap_err();

    assert!(matches!(err, ProviderError::Authentication { .. }));
    let health = openai.health().await;
    assert_eq!(health.status, HealthStatus::Unavailable);
    assert!(health.last_error.unwrap().contains("authentication failed"));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
        .expect(3)
        .mount(&server)
        .await;

    let anthropic = provider(ProviderKind::Anthropic, &server, 2);
    let err = anthropic.predict(&btc()).await.unwrap_err();

    assert_eq!(
        err,
        ProviderError::Api {
            status: 529,
            message: "overloaded".to_string()
        }
    );
}

#[tokio::test]
async fn test_rate_limit_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(SIGNAL_JSON)))
        .expect(1)
        .mount(&server)
        .await;

    let openai = provider(ProviderKind::OpenAi, &server, 1);
    let raw = assert_ok!(openai.predict(&btc()).await);
    assert_eq!(raw.decision.as_deref(), Some("BUY"));
}

#[tokio::test]
async fn test_prose_reply_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("I would lean towards buying.")))
        .expect(1)
        .mount(&server)
        .await;

    let openai = provider(ProviderKind::OpenAi, &server, 2);
    let err = openai.predict(&btc()).await.unwrap_err();
    assert_eq!(err.kind(), "malformed_response");
}

#[tokio::test]
async fn test_engine_over_http_providers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(SIGNAL_JSON)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": r#"{"decision": "HOLD", "confidence": 0.4}"# }],
            "usage": { "input_tokens": 100, "output_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let mut registry = ProviderRegistry::new();
    registry.register(provider(ProviderKind::Anthropic, &server, 0), 1.0).unwrap();
    registry.register(provider(ProviderKind::OpenAi, &server, 0), 1.0).unwrap();
    let engine = ConsensusEngine::new(registry);

    let result = assert_ok!(engine.get_consensus(&btc()).await);

    // BUY 0.82 outweighs HOLD 0.4
    assert_eq!(result.decision, Decision::Buy);
    assert_eq!(result.agreement_score, 0.5);
    assert!((result.confidence - 0.41).abs() < 1e-9);
    assert_eq!(result.total_tokens, 1620);
    assert!(result.reasoning.contains("[openai] RSI recovering from oversold"));
}
