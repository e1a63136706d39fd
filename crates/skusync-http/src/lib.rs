//! Outbound HTTP plumbing shared by the Bsale and Shopify clients.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, Instrument};

pub use reqwest::Method;

pub const CRATE_NAME: &str = "skusync-http";

const BODY_SNIPPET_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for idempotent GETs. Writes are never retried.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin reqwest wrapper: every call is bounded by the configured timeout and
/// non-success statuses are surfaced as [`FetchError::HttpStatus`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(
        &self,
        platform: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", platform, method = "GET", url);
        self.get_with_retries(url, headers).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let request = with_headers(self.client.get(url), headers);
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(status = status.as_u16(), attempt, "retrying GET");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return read_response(resp).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(error = %err, attempt, "retrying GET");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    /// Sends a JSON body once; used for writes, so there is no retry.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        platform: &str,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", platform, method = %method, url);
        async {
            let request = with_headers(self.client.request(method.clone(), url), headers).json(body);
            let resp = request.send().await?;
            read_response(resp).await
        }
        .instrument(span)
        .await
    }
}

fn with_headers(
    mut request: reqwest::RequestBuilder,
    headers: &[(&str, &str)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    request
}

async fn read_response(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp.bytes().await?.to_vec();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            body: body_snippet(&body),
        });
    }
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

/// Lossy, length-capped rendering of a response body for error messages.
pub fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.chars().count() <= BODY_SNIPPET_CHARS {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(BODY_SNIPPET_CHARS).collect::<String>();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_policy_does_not_retry() {
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn body_snippet_caps_long_bodies() {
        assert_eq!(body_snippet(b"  {\"error\":\"bad\"}\n"), "{\"error\":\"bad\"}");
        let long = "x".repeat(BODY_SNIPPET_CHARS + 10);
        let snippet = body_snippet(long.as_bytes());
        assert_eq!(snippet.chars().count(), BODY_SNIPPET_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn decode_errors_name_the_url() {
        let response = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://api.example.test/v1/variants.json".into(),
            body: b"not json".to_vec(),
        };
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert!(err.to_string().contains("api.example.test"));
    }

    #[test]
    fn client_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("skusync-test".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
