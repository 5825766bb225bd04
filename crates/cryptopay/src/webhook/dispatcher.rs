use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::error::{PaymentError, Result};
use crate::hmac::generate_secret;
use crate::queue::{DeliveryJob, TaskQueue};
use crate::store::WebhookRepository;
use crate::types::{utc_now, EventType, Payment, WebhookEndpoint, WebhookEvent};

/// Partial update of a webhook endpoint. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// Turns payment lifecycle events into per-endpoint delivery records.
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookRepository>,
    queue: Arc<dyn TaskQueue>,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn WebhookRepository>,
        queue: Arc<dyn TaskQueue>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Build the delivery records for `payment` announcing `event_type`,
    /// without persisting them. Empty when webhooks are disabled, the payment
    /// has no merchant, or no active endpoint subscribes to the event.
    pub fn prepare(&self, payment: &Payment, event_type: EventType) -> Result<Vec<WebhookEvent>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let Some(merchant_id) = payment.merchant_id.as_deref() else {
            return Ok(Vec::new());
        };

        let endpoints = self
            .store
            .active_endpoints_for(merchant_id, event_type.as_str())?;
        if endpoints.is_empty() {
            return Ok(Vec::new());
        }

        let now = utc_now();
        let payload = json!({
            "event": event_type.as_str(),
            "timestamp": now.to_rfc3339(),
            "payment": payment.public_fields(),
        });

        Ok(endpoints
            .into_iter()
            .map(|endpoint| WebhookEvent {
                id: Uuid::new_v4(),
                payment_id: Some(payment.id),
                endpoint_id: endpoint.id,
                event_type: event_type.as_str().to_string(),
                webhook_url: endpoint.url,
                payload: payload.clone(),
                attempt: 1,
                max_attempts: self.config.max_attempts,
                next_retry_at: None,
                response_code: None,
                response_body: None,
                completed_at: None,
                failed_at: None,
                created_at: now,
            })
            .collect())
    }

    /// Schedule immediate delivery of events that are already persisted.
    /// Each event is its own job, so endpoints never wait on each other.
    pub async fn enqueue(&self, events: &[WebhookEvent]) {
        for event in events {
            let job = DeliveryJob { event_id: event.id };
            if let Err(e) = self.queue.push(job, Duration::ZERO).await {
                // The row stays pending and is picked up by startup recovery.
                tracing::warn!(event_id = %event.id, error = %e, "failed to enqueue webhook event");
            }
        }
    }

    /// Prepare, persist and enqueue `event_type` for `payment` in one call.
    pub async fn trigger(&self, payment: &Payment, event_type: EventType) -> Result<Vec<WebhookEvent>> {
        let events = self.prepare(payment, event_type)?;
        if events.is_empty() {
            tracing::debug!(payment_id = %payment.id, event = %event_type, "no webhook endpoints to notify");
            return Ok(events);
        }
        self.store.insert_events(&events)?;
        self.enqueue(&events).await;
        tracing::info!(
            payment_id = %payment.id,
            event = %event_type,
            endpoints = events.len(),
            "webhook event triggered"
        );
        Ok(events)
    }

    /// Register a new endpoint for `merchant_id` with a freshly generated secret.
    pub fn register_endpoint(
        &self,
        merchant_id: &str,
        url: &str,
        events: Vec<String>,
        description: Option<String>,
    ) -> Result<WebhookEndpoint> {
        validate_url(url)?;
        validate_events(&events)?;

        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.to_string(),
            url: url.to_string(),
            secret: generate_secret(),
            events,
            description,
            is_active: true,
            consecutive_failures: 0,
            last_triggered_at: None,
            created_at: utc_now(),
        };
        self.store.insert_endpoint(&endpoint)?;
        tracing::info!(endpoint_id = %endpoint.id, merchant_id, url, "webhook endpoint registered");
        Ok(endpoint)
    }

    pub fn update_endpoint(&self, id: Uuid, update: EndpointUpdate) -> Result<WebhookEndpoint> {
        let mut endpoint = self.endpoint(id)?;

        if let Some(url) = update.url {
            validate_url(&url)?;
            endpoint.url = url;
        }
        if let Some(events) = update.events {
            validate_events(&events)?;
            endpoint.events = events;
        }
        if update.description.is_some() {
            endpoint.description = update.description;
        }
        if let Some(active) = update.is_active {
            if active && !endpoint.is_active {
                endpoint.consecutive_failures = 0;
            }
            endpoint.is_active = active;
        }

        self.store.update_endpoint(&endpoint)?;
        Ok(endpoint)
    }

    /// Turn a circuit-broken endpoint back on with a clean failure count.
    pub fn reactivate_endpoint(&self, id: Uuid) -> Result<WebhookEndpoint> {
        let mut endpoint = self.endpoint(id)?;
        endpoint.is_active = true;
        endpoint.consecutive_failures = 0;
        self.store.update_endpoint(&endpoint)?;
        tracing::info!(endpoint_id = %id, "webhook endpoint reactivated");
        Ok(endpoint)
    }

    pub fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        self.store.delete_endpoint(id)?;
        tracing::info!(endpoint_id = %id, "webhook endpoint deleted");
        Ok(())
    }

    pub fn list_endpoints(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>> {
        self.store.list_endpoints(merchant_id)
    }

    /// Queue a single-attempt `test` ping to an endpoint, active or not.
    pub async fn send_test_event(&self, endpoint_id: Uuid) -> Result<WebhookEvent> {
        let endpoint = self.endpoint(endpoint_id)?;
        let now = utc_now();
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            payment_id: None,
            endpoint_id: endpoint.id,
            event_type: EventType::Test.as_str().to_string(),
            webhook_url: endpoint.url.clone(),
            payload: json!({
                "event": EventType::Test.as_str(),
                "timestamp": now.to_rfc3339(),
                "message": "This is a test webhook from cryptopay",
            }),
            attempt: 1,
            max_attempts: 1,
            next_retry_at: None,
            response_code: None,
            response_body: None,
            completed_at: None,
            failed_at: None,
            created_at: now,
        };
        self.store.insert_events(std::slice::from_ref(&event))?;
        self.enqueue(std::slice::from_ref(&event)).await;
        Ok(event)
    }

    fn endpoint(&self, id: Uuid) -> Result<WebhookEndpoint> {
        self.store
            .get_endpoint(id)?
            .ok_or_else(|| PaymentError::NotFound(format!("webhook endpoint {id}")))
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| PaymentError::InvalidEndpoint(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            tracing::warn!(
                url = %url,
                "webhook URL does not use HTTPS, payloads will be sent in cleartext"
            );
            Ok(())
        }
        other => Err(PaymentError::InvalidEndpoint(format!(
            "{url}: unsupported scheme {other}"
        ))),
    }
}

fn validate_events(events: &[String]) -> Result<()> {
    if events.is_empty() {
        return Err(PaymentError::InvalidEndpoint(
            "at least one event type is required".into(),
        ));
    }
    match events.iter().find(|e| EventType::parse(e).is_none()) {
        Some(unknown) => Err(PaymentError::InvalidEndpoint(format!(
            "unknown event type {unknown}"
        ))),
        None => Ok(()),
    }
}
