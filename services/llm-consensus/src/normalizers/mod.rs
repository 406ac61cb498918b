// Validation and normalization of raw provider payloads
use crate::types::*;
use tracing::debug;

/// Turn a provider payload into a [`Signal`], or reject it.
///
/// Rejection (unknown decision, missing or non-finite confidence) excludes
/// the provider from aggregation. Optional fields that are missing or
/// unusable become `None`, never zero.
pub fn normalize_signal(provider_id: &str, raw: RawSignal) -> ProviderResult<Signal> {
    let decision = raw
        .decision
        .as_deref()
        .ok_or_else(|| ProviderError::malformed("missing decision"))?
        .parse::<Decision>()
        .map_err(ProviderError::malformed)?;

    let confidence = raw
        .confidence
        .as_ref()
        .ok_or_else(|| ProviderError::malformed("missing confidence"))
        .and_then(|v| {
            value_as_f64(v).ok_or_else(|| {
                ProviderError::malformed(format!("confidence is not a number: {}", v))
            })
        })?;

    if !confidence.is_finite() {
        return Err(ProviderError::malformed(format!(
            "confidence is not finite: {}",
            confidence
        )));
    }

    let risk_level = match raw.risk_level.as_deref().map(str::parse::<RiskLevel>) {
        Some(Ok(risk)) => risk,
        Some(Err(e)) => {
            debug!(provider = %provider_id, "{}, defaulting to MEDIUM", e);
            RiskLevel::Medium
        }
        None => RiskLevel::Medium,
    };

    let reasoning = match raw.reasoning {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Ok(Signal {
        provider_id: provider_id.to_string(),
        decision,
        confidence: confidence.clamp(0.0, 1.0),
        reasoning,
        risk_level,
        suggested_stop_loss: positive_price(raw.suggested_stop_loss.as_ref()),
        suggested_take_profit: positive_price(raw.suggested_take_profit.as_ref()),
        latency_ms: raw.latency_ms.filter(|v| v.is_finite() && *v >= 0.0),
        cost_usd: raw.cost_usd.filter(|v| v.is_finite() && *v >= 0.0),
        tokens_used: raw.tokens_used,
    })
}

/// Accepts JSON numbers and numeric strings ("0.82", " 0.82 ")
pub fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn positive_price(value: Option<&serde_json::Value>) -> Option<f64> {
    value
        .and_then(value_as_f64)
        .filter(|v| v.is_finite() && *v > 0.0)
}
