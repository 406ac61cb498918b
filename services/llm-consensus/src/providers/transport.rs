// HTTP plumbing for vendor APIs: error mapping, retries, backoff
use crate::types::{ProviderError, ProviderResult};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for any single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay; doubles with every attempt
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
        }
    }
}

/// `min(60s, backoff × 2^attempt + jitter)` with jitter drawn from `[0, backoff)`
pub fn backoff_delay(backoff_ms: u64, attempt: u32) -> Duration {
    if backoff_ms == 0 {
        return Duration::ZERO;
    }
    let exp = backoff_ms.saturating_mul(1u64 << attempt.min(20));
    let jitter = rand::thread_rng().gen_range(0..backoff_ms);
    Duration::from_millis(exp.saturating_add(jitter)).min(MAX_BACKOFF)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. Rate limits honour the server's retry-after.
pub async fn with_retries<T, F, Fut>(provider: &str, policy: RetryPolicy, mut op: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = match &e {
                    ProviderError::RateLimit {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(*secs).min(MAX_BACKOFF),
                    _ => backoff_delay(policy.backoff_ms, attempt),
                };
                warn!(
                    provider = %provider,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    "{}, retrying in {}ms",
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared HTTP client for one vendor endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    provider: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(provider: &str, retry: RetryPolicy, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self {
            client,
            provider: provider.to_string(),
            retry,
            request_timeout,
        }
    }

    /// POST a JSON body and decode a JSON reply, with retries
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> ProviderResult<T> {
        with_retries(&self.provider, self.retry, move || async move {
            let mut request = self.client.post(url).timeout(self.request_timeout).json(body);
            for (name, value) in headers {
                request = request.header(*name, value);
            }
            self.send(request).await
        })
        .await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> ProviderResult<T> {
        let response = request.send().await.map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(ProviderError::RateLimit { retry_after_secs });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = truncate(&text, 300);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication { message },
                _ => ProviderError::Api {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.map_reqwest_error(e))?;
        debug!(provider = %self.provider, bytes = bytes.len(), "Received response");

        serde_json::from_slice::<T>(&bytes)
            .map_err(|e| ProviderError::malformed(format!("unexpected response body: {}", e)))
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            ProviderError::malformed(e.to_string())
        } else {
            ProviderError::Transport { message: e.to_string() }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
