//! Completion notifications for the downstream merge service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CallbackConfig;
use crate::error::CallbackError;

/// Initial delay between delivery attempts.
const INITIAL_RETRY_DELAY_MS: u64 = 500;

/// Upper bound for the delay between delivery attempts.
const MAX_RETRY_DELAY_MS: u64 = 5000;

/// Longest response body kept in a rejection error.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Body of the completion notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Path of the translated subtitle.
    pub chs_subtitle_path: String,
    /// Path of the source subtitle.
    pub eng_subtitle_path: String,
    /// Path of the associated video, possibly empty.
    pub video_path: String,
}

/// Delivers completion notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &CallbackPayload) -> Result<(), CallbackError>;
}

/// HTTP notifier with bounded retries on transport errors and 5xx responses.
pub struct CallbackClient {
    client: Client,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl CallbackClient {
    /// Creates a client posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `CallbackError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration, max_retries: u32) -> Result<Self, CallbackError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            max_retries,
            retry_delay: Duration::from_millis(INITIAL_RETRY_DELAY_MS),
        })
    }

    /// Creates a client from the `callback` config section.
    pub fn from_config(config: &CallbackConfig) -> Result<Self, CallbackError> {
        Self::new(
            config.url.clone(),
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )
    }

    /// Sets the initial delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| CallbackError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(CallbackError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for CallbackClient {
    async fn notify(&self, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let max_delay = Duration::from_millis(MAX_RETRY_DELAY_MS);
        let mut delay = self.retry_delay;
        let mut attempt = 0;

        loop {
            match self.post_once(payload).await {
                Ok(()) => {
                    info!(output = %payload.chs_subtitle_path, "Callback delivered");
                    return Ok(());
                }
                Err(err) if is_retryable(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "Callback delivery failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(error: &CallbackError) -> bool {
    match error {
        CallbackError::RequestFailed(_) => true,
        CallbackError::Rejected { status, .. } => *status >= 500,
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{head}...")
}
