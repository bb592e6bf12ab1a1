//! Batched webhook delivery with bounded retry.
//!
//! Relevant events append to one ordered queue. The transition from an empty
//! to a non-empty queue arms a single timer; when it fires the whole queue is
//! sent as one request. [`WebhookDeliveryService::flush`] drains immediately
//! and disarms the timer.
//!
//! Responses:
//! - 2xx: delivered.
//! - 4xx (and other non-retryable statuses): logged and dropped.
//! - 5xx or a transport error: retried with doubling backoff up to
//!   `max_attempts` total attempts, then logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::WebhookConfig;
use crate::webhook::payload::{WebhookBody, WebhookEvent};
use crate::{AppError, Result};

/// What happened to one flushed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing was queued, or no endpoint is configured.
    Skipped,
    /// The endpoint accepted the batch.
    Delivered {
        /// Attempts used.
        attempts: u32,
    },
    /// The endpoint refused the batch permanently.
    Rejected {
        /// Response status.
        status: u16,
    },
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// Attempts used.
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct Batch {
    events: Vec<WebhookEvent>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    client: reqwest::Client,
    config: WebhookConfig,
    batch: Mutex<Batch>,
    permits: Semaphore,
}

/// Filters, batches, and ships session events to the configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookDeliveryService {
    inner: Arc<Inner>,
}

impl WebhookDeliveryService {
    /// Build the service and its pooled HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the HTTP client cannot be built.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.pool_size)
            .build()
            .map_err(|e| AppError::Transport(format!("failed to build webhook client: {e}")))?;

        if config.url.is_none() {
            info!("webhook url not configured, outbound delivery disabled");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                permits: Semaphore::new(config.pool_size.max(1)),
                config,
                batch: Mutex::new(Batch::default()),
            }),
        })
    }

    /// Queue `event` if it passes the relevance filter.
    pub async fn enqueue(&self, event: WebhookEvent) {
        if !event.update.is_relevant() || self.inner.config.url.is_none() {
            return;
        }

        let mut batch = self.inner.batch.lock().await;
        let was_empty = batch.events.is_empty();
        batch.events.push(event);

        if was_empty && batch.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            let interval = self.inner.config.batch_interval();
            batch.timer = Some(tokio::spawn(async move {
                sleep(interval).await;
                let events = {
                    let mut batch = inner.batch.lock().await;
                    batch.timer = None;
                    std::mem::take(&mut batch.events)
                };
                inner.send(events).await;
            }));
        }
    }

    /// Drain the queue now and send it as one request.
    pub async fn flush(&self) -> DeliveryOutcome {
        let events = {
            let mut batch = self.inner.batch.lock().await;
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut batch.events)
        };
        self.inner.send(events).await
    }

    /// Number of queued events.
    pub async fn queued(&self) -> usize {
        self.inner.batch.lock().await.events.len()
    }
}

impl Inner {
    async fn send(&self, events: Vec<WebhookEvent>) -> DeliveryOutcome {
        let Some(url) = self.config.url.as_deref() else {
            return DeliveryOutcome::Skipped;
        };
        if events.is_empty() {
            return DeliveryOutcome::Skipped;
        }

        let span = info_span!("webhook_flush", updates = events.len());
        async {
            let body = match WebhookBody::from_events(&events) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%err, "failed to serialise webhook batch, dropping");
                    return DeliveryOutcome::Skipped;
                }
            };

            let Ok(_permit) = self.permits.acquire().await else {
                return DeliveryOutcome::Skipped;
            };

            let max_attempts = self.config.max_attempts.max(1);

            for attempt in 1..=max_attempts {
                match self.post(url, &body).await {
                    Ok(status) if status.is_success() => {
                        debug!(attempt, status = status.as_u16(), "webhook batch delivered");
                        return DeliveryOutcome::Delivered { attempts: attempt };
                    }
                    Ok(status) if !status.is_server_error() => {
                        warn!(
                            attempt,
                            status = status.as_u16(),
                            "webhook rejected batch, dropping"
                        );
                        return DeliveryOutcome::Rejected {
                            status: status.as_u16(),
                        };
                    }
                    Ok(status) => {
                        warn!(attempt, status = status.as_u16(), "webhook server error");
                    }
                    Err(err) => {
                        warn!(attempt, %err, "webhook transport error");
                    }
                }

                if attempt < max_attempts {
                    let delay = backoff_delay(self.config.base_delay(), attempt);
                    debug!(attempt, delay = ?delay, "retrying webhook batch");
                    sleep(delay).await;
                }
            }

            warn!(attempts = max_attempts, "webhook retries exhausted, dropping batch");
            DeliveryOutcome::Exhausted {
                attempts: max_attempts,
            }
        }
        .instrument(span)
        .await
    }

    async fn post(&self, url: &str, body: &WebhookBody) -> Result<StatusCode> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = self.config.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Ok(response.status())
    }
}

/// Delay before retry number `retry` (1-based) for a base delay.
#[must_use]
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}
