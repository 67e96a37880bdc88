// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::CrawlerConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &CrawlerConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Source of HTML pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page body in a single attempt.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// [`PageSource`] backed by a reqwest client.
pub struct HttpPageSource {
    client: reqwest::Client,
}

impl HttpPageSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &CrawlerConfig) -> Result<Self> {
        Ok(Self::new(create_async_client(config)?))
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        let text = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }
}

/// Retry schedule for page fetches: `retries` extra attempts, backoff doubling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            retries: config.fetch_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Fetch a page, retrying transport and status failures with exponential backoff.
///
/// Errors that are not retryable end the loop at once.
pub async fn fetch_with_retry(
    source: &dyn PageSource,
    url: &str,
    policy: &RetryPolicy,
) -> Result<String> {
    let attempts = policy.retries + 1;
    let mut last_error = None;

    for attempt in 0..attempts {
        match source.fetch(url).await {
            Ok(body) => return Ok(body),
            Err(e) if !e.is_retryable() => return Err(AppError::fetch(url, attempt + 1, e)),
            Err(e) => {
                tracing::warn!(
                    url,
                    attempt = attempt + 1,
                    attempts,
                    error = %e,
                    "Page fetch failed"
                );
                last_error = Some(e);
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempt made".into());
    Err(AppError::fetch(url, attempts, message))
}
