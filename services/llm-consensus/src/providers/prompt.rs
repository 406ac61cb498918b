// Prompt construction and reply parsing shared by the HTTP providers
use crate::types::{MarketContext, ProviderError, ProviderResult, RawSignal};
use serde_json::{Map, Value};

/// Lists in market data are cut to this many items in the prompt
const MAX_LIST_ITEMS: usize = 5;

/// Keys the engine measures itself; ignored if a model echoes them back
const TELEMETRY_KEYS: [&str; 3] = ["latency_ms", "cost_usd", "tokens_used"];

const RESPONSE_FORMAT: &str = r#"Please provide your analysis in the following JSON format:
{
    "decision": "BUY" or "SELL" or "HOLD",
    "confidence": 0.0 to 1.0,
    "reasoning": "Brief explanation of your decision",
    "risk_level": "low" or "medium" or "high",
    "suggested_stop_loss": price level (optional),
    "suggested_take_profit": price level (optional)
}

Respond ONLY with valid JSON, no additional text."#;

/// Render the standard analyst prompt for a market context
pub fn build_prompt(context: &MarketContext) -> String {
    match context {
        MarketContext::TradingPair {
            pair,
            timeframe,
            current_price,
            indicators,
        } => format!(
            "You are an expert trading analyst. Analyze the following market data and provide a trading recommendation.\n\n\
             Market Data:\n{}\n\n\
             Current Context:\n- Pair: {}\n- Timeframe: {}\n- Current Price: {}\n\n{}",
            format_market_data(indicators),
            pair,
            timeframe,
            current_price.map(format_float).unwrap_or_else(|| "N/A".to_string()),
            RESPONSE_FORMAT
        ),
        MarketContext::PredictionMarket {
            question,
            yes_price,
            no_price,
            volume_24h,
            days_to_expiration,
            expiration_date,
            extra,
        } => {
            let no_price = no_price.unwrap_or(1.0 - yes_price);
            let mut lines = vec![
                format!("- Question: {}", question),
                format!("- YES price: {} (implied probability {:.1}%)", format_float(*yes_price), yes_price * 100.0),
                format!("- NO price: {}", format_float(no_price)),
            ];
            if let Some(volume) = volume_24h {
                lines.push(format!("- 24h volume: ${:.0}", volume));
            }
            if let Some(days) = days_to_expiration {
                lines.push(format!("- Days to expiration: {}", format_float(*days)));
            }
            if let Some(date) = expiration_date {
                lines.push(format!("- Expiration date: {}", date));
            }

            let mut prompt = format!(
                "You are an expert prediction market analyst. Estimate whether the YES outcome is mispriced.\n\
                 BUY means buy YES, SELL means buy NO, HOLD means no edge.\n\n\
                 Market:\n{}",
                lines.join("\n")
            );
            if !extra.is_empty() {
                prompt.push_str("\n\nAdditional Data:\n");
                prompt.push_str(&format_market_data(extra));
            }
            prompt.push_str("\n\n");
            prompt.push_str(RESPONSE_FORMAT);
            prompt
        }
    }
}

/// One `key: value` line per entry; floats to 4 decimals, lists truncated
pub fn format_market_data(data: &Map<String, Value>) -> String {
    data.iter()
        .map(|(key, value)| match value {
            Value::Array(items) if items.len() > MAX_LIST_ITEMS => {
                let head: Vec<String> = items[..MAX_LIST_ITEMS].iter().map(format_value).collect();
                format!("{}: [{}]... (showing first {})", key, head.join(", "), MAX_LIST_ITEMS)
            }
            other => format!("{}: {}", key, format_value(other)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64().map(format_float).unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(format_value).collect::<Vec<_>>().join(", ")
        ),
        other => other.to_string(),
    }
}

fn format_float(v: f64) -> String {
    format!("{:.4}", v)
}

/// Pull the JSON object out of a model reply.
///
/// Tried in order: a ```json fence, any ``` fence holding an object, the
/// first balanced `{...}` in the text, then the trimmed text as-is.
pub fn extract_json(text: &str) -> &str {
    if let Some(inner) = fenced(text, "```json") {
        return inner;
    }
    if let Some(inner) = fenced(text, "```").filter(|s| s.starts_with('{')) {
        return inner;
    }
    if let Some(object) = first_object(text) {
        return object;
    }
    text.trim()
}

fn fenced<'a>(text: &'a str, open: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// First brace-balanced object, ignoring braces inside string literals
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse a model reply into a [`RawSignal`]. Keys are matched case-insensitively.
pub fn parse_signal_text(text: &str) -> ProviderResult<RawSignal> {
    let json = extract_json(text);
    let value: Value = serde_json::from_str(json)
        .map_err(|e| ProviderError::malformed(format!("invalid JSON in reply: {}", e)))?;

    let Value::Object(object) = value else {
        return Err(ProviderError::malformed("reply is not a JSON object"));
    };

    let normalized: Map<String, Value> = object
        .into_iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v))
        .filter(|(k, _)| !TELEMETRY_KEYS.contains(&k.as_str()))
        .collect();

    serde_json::from_value(Value::Object(normalized))
        .map_err(|e| ProviderError::malformed(format!("unexpected signal shape: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trading_prompt_formats_indicators() {
        let mut ctx = MarketContext::trading_pair("BTC/USDT", "5m");
        if let MarketContext::TradingPair { current_price, indicators, .. } = &mut ctx {
            *current_price = Some(43250.5);
            indicators.insert("rsi".to_string(), json!(58.123456));
            indicators.insert("closes".to_string(), json!([1, 2, 3, 4, 5, 6, 7]));
            indicators.insert("trend".to_string(), json!("up"));
        }

        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("- Pair: BTC/USDT"));
        assert!(prompt.contains("- Current Price: 43250.5000"));
        assert!(prompt.contains("rsi: 58.1235"));
        assert!(prompt.contains("closes: [1, 2, 3, 4, 5]... (showing first 5)"));
        assert!(prompt.contains("trend: up"));
        assert!(prompt.ends_with("no additional text."));
    }

    #[test]
    fn test_prediction_prompt_derives_no_price() {
        let ctx = MarketContext::prediction_market("Will it rain in Paris tomorrow?", 0.25);
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("- Question: Will it rain in Paris tomorrow?"));
        assert!(prompt.contains("- NO price: 0.7500"));
        assert!(prompt.contains("implied probability 25.0%"));
    }

    #[test]
    fn test_extract_json_strategies() {
        let fenced_json = "Here you go:\n```json\n{\"decision\": \"BUY\"}\n```\nthanks";
        assert_eq!(extract_json(fenced_json), "{\"decision\": \"BUY\"}");

        let plain_fence = "```\n{\"decision\": \"SELL\"}\n```";
        assert_eq!(extract_json(plain_fence), "{\"decision\": \"SELL\"}");

        let embedded = "I think {\"decision\": \"HOLD\", \"meta\": {\"note\": \"}\"}} is right";
        assert_eq!(
            extract_json(embedded),
            "{\"decision\": \"HOLD\", \"meta\": {\"note\": \"}\"}}"
        );

        assert_eq!(extract_json("  no json here  "), "no json here");
    }

    #[test]
    fn test_parse_signal_text_lowercases_keys() {
        let reply = r#"```json
{"Decision": "buy", "CONFIDENCE": "0.8", "reasoning": "breakout", "latency_ms": "fast"}
```"#;
        let raw = parse_signal_text(reply).unwrap();
        assert_eq!(raw.decision.as_deref(), Some("buy"));
        assert_eq!(raw.confidence, Some(json!("0.8")));
        assert_eq!(raw.latency_ms, None);
    }

    #[test]
    fn test_parse_signal_text_rejects_garbage() {
        assert_eq!(
            parse_signal_text("I cannot help with that").unwrap_err().kind(),
            "malformed_response"
        );
        assert!(parse_signal_text("[1, 2, 3]").is_err());
    }
}
