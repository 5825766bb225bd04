//! Plain data aggregates: payments, webhook endpoints and events, rates, audit rows.
//!
//! These carry no persistence logic. The [`crate::store`] repositories load and
//! save them; [`crate::ledger`] and [`crate::webhook`] own the business rules.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::PaymentError;

/// Current time at the millisecond precision timestamps are stored with.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Lifecycle state of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirming,
    Confirmed,
    Completed,
    Expired,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirming" => Some(Self::Confirming),
            "confirmed" => Some(Self::Confirmed),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Expired | Self::Failed | Self::Refunded
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::Confirming => *self == Self::Pending,
            Self::Confirmed => matches!(self, Self::Pending | Self::Confirming),
            Self::Completed => *self == Self::Confirmed,
            Self::Expired | Self::Failed | Self::Refunded => true,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the payer is expected to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Native,
    Contract,
    Multisig,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Contract => "contract",
            Self::Multisig => "multisig",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native" => Some(Self::Native),
            "contract" => Some(Self::Contract),
            "multisig" => Some(Self::Multisig),
            _ => None,
        }
    }
}

/// Lifecycle event types delivered to webhook endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PaymentCreated,
    PaymentConfirming,
    PaymentConfirmed,
    PaymentCompleted,
    PaymentFailed,
    PaymentExpired,
    PaymentRefunded,
    /// Connectivity check with no payment attached.
    Test,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCreated => "payment_created",
            Self::PaymentConfirming => "payment_confirming",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::PaymentCompleted => "payment_completed",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentExpired => "payment_expired",
            Self::PaymentRefunded => "payment_refunded",
            Self::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_created" => Some(Self::PaymentCreated),
            "payment_confirming" => Some(Self::PaymentConfirming),
            "payment_confirmed" => Some(Self::PaymentConfirmed),
            "payment_completed" => Some(Self::PaymentCompleted),
            "payment_failed" => Some(Self::PaymentFailed),
            "payment_expired" => Some(Self::PaymentExpired),
            "payment_refunded" => Some(Self::PaymentRefunded),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    /// The event announced when a payment enters `status`, if any.
    pub fn for_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Pending => None,
            PaymentStatus::Confirming => Some(Self::PaymentConfirming),
            PaymentStatus::Confirmed => Some(Self::PaymentConfirmed),
            PaymentStatus::Completed => Some(Self::PaymentCompleted),
            PaymentStatus::Expired => Some(Self::PaymentExpired),
            PaymentStatus::Failed => Some(Self::PaymentFailed),
            PaymentStatus::Refunded => Some(Self::PaymentRefunded),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payment aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub reference_code: String,
    pub merchant_id: Option<String>,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub amount_crypto: Decimal,
    pub amount_fiat: Decimal,
    pub fiat_currency: String,
    pub wallet_address: String,
    pub transaction_hash: Option<String>,
    pub status: PaymentStatus,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub exchange_rate: Decimal,
    pub network_fee: Option<Decimal>,
    pub platform_fee: Decimal,
    pub fee_percentage: Decimal,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every persisted write.
    pub version: i64,
}

impl Payment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= self.required_confirmations
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn total_fee(&self) -> Decimal {
        self.network_fee.unwrap_or_default() + self.platform_fee
    }

    /// Fiat amount left for the merchant once fees are taken.
    pub fn amount_received(&self) -> Decimal {
        self.amount_fiat - self.total_fee()
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition_to(
        &mut self,
        next: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        if !self.status.can_transition_to(next) {
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == PaymentStatus::Completed {
            self.paid_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Record an observed confirmation count. Counts never go backwards and
    /// terminal payments are left untouched. Returns true if the count changed.
    pub fn observe_confirmations(&mut self, observed: u32) -> bool {
        if self.is_terminal() || observed <= self.confirmations {
            return false;
        }
        self.confirmations = observed;
        true
    }

    /// The public view embedded in webhook payloads.
    pub fn public_fields(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "reference_code": self.reference_code,
            "currency": self.currency,
            "amount_crypto": self.amount_crypto.to_string(),
            "amount_fiat": self.amount_fiat.to_string(),
            "fiat_currency": self.fiat_currency,
            "wallet_address": self.wallet_address,
            "transaction_hash": self.transaction_hash,
            "status": self.status.as_str(),
            "confirmations": self.confirmations,
            "required_confirmations": self.required_confirmations,
            "exchange_rate": self.exchange_rate.to_string(),
            "paid_at": self.paid_at.map(|t| t.to_rfc3339()),
            "metadata": self.metadata,
        })
    }
}

/// Caller-supplied knobs for a new payment request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentOptions {
    pub fee_percentage: Option<Decimal>,
    pub expires_in_minutes: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub description: Option<String>,
    pub order_id: Option<String>,
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

/// Receiving address bookkeeping row; created once per (address, currency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRegistration {
    pub address: String,
    pub currency: String,
    pub merchant_id: Option<String>,
    pub label: String,
    pub is_active: bool,
}

/// A merchant-owned webhook subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub merchant_id: String,
    pub url: String,
    /// Signing secret, generated once at registration.
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub consecutive_failures: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn supports_event(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

/// Delivery state of a single webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    InFlight,
    Completed,
    Failed,
}

/// One (endpoint, event) delivery record. The payload is frozen at trigger time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub payment_id: Option<Uuid>,
    pub endpoint_id: Uuid,
    pub event_type: String,
    pub webhook_url: String,
    pub payload: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn state(&self) -> DeliveryState {
        match (self.completed_at, self.failed_at) {
            (Some(_), _) => DeliveryState::Completed,
            (None, Some(_)) => DeliveryState::Failed,
            (None, None) => DeliveryState::InFlight,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != DeliveryState::InFlight
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Last known conversion rate for a currency pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub crypto_currency: String,
    pub fiat_currency: String,
    pub rate: Decimal,
    pub source: String,
    pub volume_24h: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub change_24h: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row attached to a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub payment_id: Uuid,
    pub action: String,
    pub changes: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(payment_id: Uuid, action: &str, changes: Value) -> Self {
        Self {
            payment_id,
            action: action.to_string(),
            changes,
            created_at: utc_now(),
        }
    }
}
