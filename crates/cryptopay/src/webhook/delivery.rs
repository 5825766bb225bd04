use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use uuid::Uuid;

use super::{canonical_json, EVENT_HEADER, SIGNATURE_HEADER};
use crate::config::WebhookConfig;
use crate::error::{PaymentError, Result};
use crate::hmac::sign_payload;
use crate::metrics;
use crate::queue::{DeliveryJob, TaskQueue};
use crate::store::WebhookRepository;
use crate::types::{utc_now, EventType, WebhookEvent};

/// Stored response bodies are cut to this many characters.
const MAX_STORED_BODY: usize = 1024;

/// What one call to [`DeliveryWorker::deliver`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        status: u16,
    },
    /// Attempt failed; `attempt` is scheduled at `next_retry_at`.
    Retrying {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the event is terminally failed.
    Failed {
        endpoint_deactivated: bool,
    },
    /// Nothing to do: unknown, already terminal, already in flight, or not due.
    Skipped,
}

/// Performs webhook delivery attempts pulled from the task queue.
pub struct DeliveryWorker {
    store: Arc<dyn WebhookRepository>,
    queue: Arc<dyn TaskQueue>,
    http: reqwest::Client,
    config: WebhookConfig,
    in_flight: DashSet<Uuid>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn WebhookRepository>,
        queue: Arc<dyn TaskQueue>,
        config: WebhookConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cryptopay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PaymentError::Internal(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            store,
            queue,
            http,
            config,
            in_flight: DashSet::new(),
        })
    }

    /// Run one delivery attempt for `event_id` and record its outcome before
    /// returning, so the next attempt can never overlap this one.
    pub async fn deliver(&self, event_id: Uuid) -> Result<DeliveryOutcome> {
        if !self.in_flight.insert(event_id) {
            return Ok(DeliveryOutcome::Skipped);
        }
        let outcome = self.attempt(event_id).await;
        self.in_flight.remove(&event_id);
        outcome
    }

    async fn attempt(&self, event_id: Uuid) -> Result<DeliveryOutcome> {
        let Some(event) = self.store.get_event(event_id)? else {
            tracing::debug!(event_id = %event_id, "webhook event no longer exists");
            return Ok(DeliveryOutcome::Skipped);
        };
        if event.is_terminal() {
            return Ok(DeliveryOutcome::Skipped);
        }

        let now = utc_now();
        if let Some(due) = event.next_retry_at.filter(|due| *due > now) {
            // Early duplicate of a backed-off job: put it back for the remainder.
            let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
            self.queue.push(DeliveryJob { event_id }, remaining).await?;
            return Ok(DeliveryOutcome::Skipped);
        }

        let endpoint = match self.store.get_endpoint(event.endpoint_id)? {
            Some(endpoint) => endpoint,
            None => {
                tracing::warn!(event_id = %event_id, endpoint_id = %event.endpoint_id, "webhook endpoint deleted, dropping event");
                self.store.mark_dropped(event_id, "endpoint deleted", now)?;
                metrics::WEBHOOK_DELIVERIES.with_label_values(&["dropped"]).inc();
                return Ok(DeliveryOutcome::Failed {
                    endpoint_deactivated: false,
                });
            }
        };
        if !endpoint.is_active && event.event_type != EventType::Test.as_str() {
            tracing::info!(event_id = %event_id, endpoint_id = %endpoint.id, "webhook endpoint inactive, dropping event");
            self.store.mark_dropped(event_id, "endpoint inactive", now)?;
            metrics::WEBHOOK_DELIVERIES.with_label_values(&["dropped"]).inc();
            return Ok(DeliveryOutcome::Failed {
                endpoint_deactivated: false,
            });
        }

        let body = canonical_json(&event.payload)?;
        let signature = sign_payload(endpoint.secret.as_bytes(), &body);

        let result = self
            .http
            .post(&event.webhook_url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event.event_type.as_str())
            .timeout(self.config.timeout())
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status().as_u16();
                let text = truncate(resp.text().await.unwrap_or_default());
                self.store.mark_delivered(event_id, status, &text, utc_now())?;
                metrics::WEBHOOK_DELIVERIES.with_label_values(&["delivered"]).inc();
                tracing::info!(
                    event_id = %event_id,
                    url = %event.webhook_url,
                    event = %event.event_type,
                    attempt = event.attempt,
                    status,
                    "webhook delivered"
                );
                Ok(DeliveryOutcome::Delivered { status })
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = truncate(resp.text().await.unwrap_or_default());
                let err = PaymentError::WebhookDelivery(format!("endpoint returned {status}"));
                self.record_failure(&event, Some(status), text, err).await
            }
            Err(e) => {
                let err = if e.is_timeout() {
                    PaymentError::WebhookDelivery(format!(
                        "timed out after {:?}",
                        self.config.timeout()
                    ))
                } else {
                    PaymentError::WebhookDelivery(e.to_string())
                };
                let text = err.to_string();
                self.record_failure(&event, None, text, err).await
            }
        }
    }

    async fn record_failure(
        &self,
        event: &WebhookEvent,
        status: Option<u16>,
        detail: String,
        err: PaymentError,
    ) -> Result<DeliveryOutcome> {
        let now = utc_now();

        if event.attempts_exhausted() {
            let health = self.store.mark_failed(
                event.id,
                status,
                Some(&detail),
                now,
                self.config.failure_threshold,
            )?;
            metrics::WEBHOOK_DELIVERIES.with_label_values(&["failed"]).inc();
            tracing::warn!(
                event_id = %event.id,
                url = %event.webhook_url,
                attempt = event.attempt,
                error = %err,
                "webhook delivery failed permanently"
            );

            let deactivated = health.map(|h| h.deactivated).unwrap_or(false);
            if let Some(health) = health.filter(|h| h.deactivated) {
                tracing::warn!(
                    endpoint_id = %event.endpoint_id,
                    consecutive_failures = health.consecutive_failures,
                    "webhook endpoint deactivated after repeated failures"
                );
            }
            return Ok(DeliveryOutcome::Failed {
                endpoint_deactivated: deactivated,
            });
        }

        let delay = self.config.retry_delay(event.attempt);
        let next_attempt = event.attempt + 1;
        let next_retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        self.store.schedule_retry(
            event.id,
            next_attempt,
            next_retry_at,
            status,
            Some(&detail),
        )?;
        self.queue
            .push(DeliveryJob { event_id: event.id }, delay)
            .await?;
        metrics::WEBHOOK_DELIVERIES.with_label_values(&["retry"]).inc();
        tracing::info!(
            event_id = %event.id,
            url = %event.webhook_url,
            attempt = event.attempt,
            next_attempt,
            delay_secs = delay.as_secs(),
            error = %err,
            "webhook delivery failed, retry scheduled"
        );
        Ok(DeliveryOutcome::Retrying {
            attempt: next_attempt,
            next_retry_at,
        })
    }

    /// Re-enqueue every non-terminal event, honouring its `next_retry_at`.
    /// Call once at startup before spawning workers.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.pending_events()?;
        let now = utc_now();
        for event in &pending {
            let delay = event
                .next_retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.queue
                .push(DeliveryJob { event_id: event.id }, delay)
                .await?;
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "re-enqueued pending webhook events");
        }
        Ok(pending.len())
    }

    /// Spawn `count` workers consuming the queue until it is closed.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(job) = this.queue.pop().await {
                        if let Err(e) = this.deliver(job.event_id).await {
                            tracing::error!(worker, event_id = %job.event_id, error = %e, "webhook delivery errored");
                            let retry = this.config.retry_delay(1);
                            if let Err(e) = this.queue.push(job, retry).await {
                                tracing::error!(event_id = %job.event_id, error = %e, "failed to requeue webhook event");
                            }
                        }
                    }
                    tracing::debug!(worker, "delivery worker stopped");
                })
            })
            .collect()
    }
}

fn truncate(mut body: String) -> String {
    if let Some((idx, _)) = body.char_indices().nth(MAX_STORED_BODY) {
        body.truncate(idx);
    }
    body
}
