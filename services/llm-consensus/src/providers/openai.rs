// OpenAI-compatible chat completions (OpenAI, xAI Grok)
use super::{ChatBackend, ClientOptions, Completion, HttpProvider};
use super::transport::HttpTransport;
use crate::types::{ProviderError, ProviderResult};
use serde::Deserialize;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4-turbo";
pub const GROK_BASE_URL: &str = "https://api.x.ai/v1";
pub const GROK_DEFAULT_MODEL: &str = "grok-beta";

pub type OpenAiCompatibleProvider = HttpProvider<ChatCompletionsApi>;

pub struct ChatCompletionsApi {
    transport: HttpTransport,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait::async_trait]
impl ChatBackend for ChatCompletionsApi {
    fn from_options(id: &str, options: &ClientOptions) -> Self {
        Self {
            transport: HttpTransport::new(id, options.retry, options.request_timeout),
        }
    }

    async fn complete(&self, options: &ClientOptions, api_key: &str, prompt: &str) -> ProviderResult<Completion> {
        let url = format!("{}/chat/completions", options.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": options.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let headers = [("authorization", format!("Bearer {}", api_key))];

        let response: ChatResponse = self.transport.post_json(&url, &headers, &body).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::malformed("no message content in choices"))?;

        Ok(Completion {
            text,
            input_tokens: response.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: response.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}
