//! Persistence interfaces.
//!
//! Domain services talk to storage only through these traits. Implementations
//! must be thread-safe (`Send + Sync`); multi-row writes that belong together
//! (payment creation, status transitions, delivery outcomes) are atomic.
//!
//! [`sqlite::Database`] implements all of them on one SQLite connection.

pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    AddressRegistration, AuditEntry, ExchangeRate, Payment, WebhookEndpoint, WebhookEvent,
};

pub use sqlite::Database;

/// Everything written when a payment is created. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct PaymentCreation {
    pub payment: Payment,
    pub address: AddressRegistration,
    pub events: Vec<WebhookEvent>,
    pub audit: Vec<AuditEntry>,
}

/// A versioned update of an existing payment plus its side records.
#[derive(Debug, Clone)]
pub struct PaymentChange {
    /// New state. `payment.version` must still equal the stored version.
    pub payment: Payment,
    pub events: Vec<WebhookEvent>,
    pub audit: Vec<AuditEntry>,
}

/// Keyset position within a reconciliation sweep.
pub type SweepCursor = i64;

pub trait PaymentRepository: Send + Sync {
    /// Insert payment, address registration (create-if-absent), webhook events
    /// and audit rows in one transaction.
    fn create_payment(&self, creation: &PaymentCreation) -> Result<()>;

    /// Persist a change if nobody else wrote the payment since it was loaded.
    /// Returns the stored payment with its new version, or `Conflict`.
    fn save_payment(&self, change: &PaymentChange) -> Result<Payment>;

    fn get_payment(&self, id: Uuid) -> Result<Option<Payment>>;

    fn find_by_reference(&self, reference_code: &str) -> Result<Option<Payment>>;

    /// Next batch of live payments the reconciler should look at: pending
    /// ones (so expiry can apply) and confirming ones until `confirming_grace`
    /// past their expiry.
    fn due_for_reconciliation(
        &self,
        now: DateTime<Utc>,
        confirming_grace: Duration,
        after: SweepCursor,
        limit: usize,
    ) -> Result<Vec<(SweepCursor, Payment)>>;

    fn audit_trail(&self, payment_id: Uuid) -> Result<Vec<AuditEntry>>;

    fn address(&self, address: &str, currency: &str) -> Result<Option<AddressRegistration>>;

    /// Hide a payment from reads and sweeps; rows are kept.
    fn soft_delete_payment(&self, id: Uuid) -> Result<()>;

    /// Remove a payment together with its webhook events and audit trail.
    fn delete_payment(&self, id: Uuid) -> Result<()>;
}

/// Result of recording a terminal delivery failure against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHealth {
    pub consecutive_failures: u32,
    /// True only for the failure that crossed the threshold.
    pub deactivated: bool,
}

pub trait WebhookRepository: Send + Sync {
    fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>>;

    fn list_endpoints(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>>;

    /// Active endpoints of `merchant_id` subscribed to `event_type`.
    fn active_endpoints_for(
        &self,
        merchant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>>;

    /// Overwrite the mutable endpoint fields (url, events, description,
    /// active flag, failure counter). The secret never changes.
    fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    fn delete_endpoint(&self, id: Uuid) -> Result<()>;

    /// Insert events outside a payment transaction (e.g. test pings).
    fn insert_events(&self, events: &[WebhookEvent]) -> Result<()>;

    fn get_event(&self, id: Uuid) -> Result<Option<WebhookEvent>>;

    fn events_for_payment(&self, payment_id: Uuid) -> Result<Vec<WebhookEvent>>;

    /// Events with neither `completed_at` nor `failed_at` set.
    fn pending_events(&self) -> Result<Vec<WebhookEvent>>;

    /// Mark success and reset the endpoint failure counter. Returns false if
    /// the event was already terminal.
    fn mark_delivered(
        &self,
        event_id: Uuid,
        response_code: u16,
        response_body: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a failed attempt that will be retried.
    fn schedule_retry(
        &self,
        event_id: Uuid,
        next_attempt: u32,
        next_retry_at: DateTime<Utc>,
        response_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Mark the event failed without an attempt, leaving the endpoint's
    /// failure counter alone. False if already terminal.
    fn mark_dropped(&self, event_id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Mark the event failed, bump the endpoint failure counter and deactivate
    /// the endpoint when it reaches `threshold`. `None` if already terminal.
    fn mark_failed(
        &self,
        event_id: Uuid,
        response_code: Option<u16>,
        error: Option<&str>,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> Result<Option<EndpointHealth>>;
}

pub trait RateRepository: Send + Sync {
    fn latest_rate(&self, crypto: &str, fiat: &str) -> Result<Option<ExchangeRate>>;

    /// One row per pair; replaces the existing one.
    fn upsert_rate(&self, rate: &ExchangeRate) -> Result<()>;
}

/// Named lease used to keep a periodic job on a single instance.
pub trait SweepLock: Send + Sync {
    /// Take or renew the lease. False if another holder has an unexpired lease.
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    fn release(&self, name: &str, holder: &str) -> Result<()>;
}
