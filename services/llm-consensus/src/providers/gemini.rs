// Google Gemini generateContent API
use super::{ChatBackend, ClientOptions, Completion, HttpProvider};
use super::transport::HttpTransport;
use crate::types::{ProviderError, ProviderResult};
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";

pub type GeminiProvider = HttpProvider<GenerateContentApi>;

pub struct GenerateContentApi {
    transport: HttpTransport,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

/// Rough count for replies that omit usage metadata
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

#[async_trait::async_trait]
impl ChatBackend for GenerateContentApi {
    fn from_options(id: &str, options: &ClientOptions) -> Self {
        Self {
            transport: HttpTransport::new(id, options.retry, options.request_timeout),
        }
    }

    async fn complete(&self, options: &ClientOptions, api_key: &str, prompt: &str) -> ProviderResult<Completion> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            options.base_url.trim_end_matches('/'),
            options.model
        );
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            },
        });
        let headers = [("x-goog-api-key", api_key.to_string())];

        let response: GenerateResponse = self.transport.post_json(&url, &headers, &body).await?;

        let text = response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| ProviderError::malformed("no text in candidates"))?;

        let usage = response.usage_metadata.as_ref();
        let input_tokens = usage
            .and_then(|u| u.prompt_token_count)
            .unwrap_or_else(|| estimate_tokens(prompt));
        let output_tokens = usage
            .and_then(|u| u.candidates_token_count)
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(Completion {
            text,
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_without_usage_metadata_parses() {
        let json = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "{}" }], "role": "model" } }]
        });
        let parsed: GenerateResponse = serde_json::from_value(json).unwrap();
        assert!(parsed.usage_metadata.is_none());
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
