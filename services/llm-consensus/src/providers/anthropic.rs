// Anthropic Messages API
use super::{ChatBackend, ClientOptions, Completion, HttpProvider};
use super::transport::HttpTransport;
use crate::types::{ProviderError, ProviderResult};
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";

pub type AnthropicProvider = HttpProvider<AnthropicApi>;

pub struct AnthropicApi {
    transport: HttpTransport,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait::async_trait]
impl ChatBackend for AnthropicApi {
    fn from_options(id: &str, options: &ClientOptions) -> Self {
        Self {
            transport: HttpTransport::new(id, options.retry, options.request_timeout),
        }
    }

    async fn complete(&self, options: &ClientOptions, api_key: &str, prompt: &str) -> ProviderResult<Completion> {
        let url = format!("{}/v1/messages", options.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": options.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let headers = [
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", API_VERSION.to_string()),
        ];

        let response: MessagesResponse = self.transport.post_json(&url, &headers, &body).await?;

        let text = response
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| ProviderError::malformed("no text content in message"))?;

        Ok(Completion {
            text,
            input_tokens: response.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: response.usage.as_ref().map(|u| u.output_tokens),
        })
    }
}
