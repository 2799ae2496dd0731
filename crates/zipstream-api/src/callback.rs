//! Outcome callback dispatcher.
//!
//! After the stream closes, the authoritative outcome is POSTed to the
//! manifest's callback URL — the HTTP status line cannot convey partial or
//! failed outcomes once streaming has begun. Dispatch happens off the
//! request path and never affects the user-visible response.

use std::time::Duration;

use serde::Serialize;

use crate::metrics::{CALLBACKS_TOTAL, CALLBACK_RETRIES_TOTAL};

const CALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON body sent to the callback URL.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    /// Manifest id.
    pub id: String,
    /// Terminal outcome (completed, partial, failed).
    pub status: String,
    /// RFC 3339 completion timestamp.
    pub timestamp: String,
    /// Outcome detail, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Objects named by the manifest after filtering.
    pub file_count: usize,
    /// Compressed bytes written to the client.
    pub compressed_size_bytes: u64,
}

/// POSTs outcome payloads with exponential-backoff retries.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl CallbackDispatcher {
    /// Creates a dispatcher with one shared HTTP client.
    #[must_use]
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            max_retries,
            retry_delay,
        }
    }

    /// Delivers one payload, retrying with backoff `delay * 2^(n-1)`.
    ///
    /// Both 4xx and 5xx responses count as failures for retry purposes.
    /// The terminal result only lands in metrics and logs.
    pub async fn dispatch(&self, url: &str, payload: CallbackPayload) {
        if url.is_empty() {
            return;
        }

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                metrics::counter!(CALLBACK_RETRIES_TOTAL).increment(1);
                let delay = self.retry_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
                tracing::info!(url, attempt, "retrying callback");
            }

            match self.send(url, &payload).await {
                Ok(()) => {
                    metrics::counter!(CALLBACKS_TOTAL, "status" => "success").increment(1);
                    return;
                }
                Err(e) => {
                    tracing::warn!(url, attempt, error = %e, "callback attempt failed");
                    if attempt == self.max_retries {
                        metrics::counter!(CALLBACKS_TOTAL, "status" => "failure").increment(1);
                        tracing::error!(
                            url,
                            total_attempts = attempt + 1,
                            error = %e,
                            "callback failed after retries"
                        );
                    }
                }
            }
        }
    }

    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("send error: {e}"))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(format!("bad status: {status}"));
        }
        Ok(())
    }
}
