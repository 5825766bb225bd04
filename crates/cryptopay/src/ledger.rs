//! Payment lifecycle: creation, confirmation tracking and explicit
//! completion, refund and failure.
//!
//! ```text
//! pending ──> confirming ──> confirmed ──> completed
//!    │            │              │
//!    └────────────┴──────────────┴──> expired (pending only) | failed | refunded
//! ```
//!
//! Every persisted change goes through a version-guarded write together with
//! the webhook events and audit rows it produces. Events are enqueued for
//! delivery only after that write commits.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::chain::ChainRegistry;
use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::metrics;
use crate::rates::ExchangeRateCache;
use crate::store::{PaymentChange, PaymentCreation, PaymentRepository};
use crate::types::{
    utc_now, AddressRegistration, AuditEntry, EventType, Payment, PaymentOptions, PaymentStatus,
    WebhookEvent,
};
use crate::webhook::WebhookDispatcher;

/// Reference-code collisions tolerated before creation gives up.
const MAX_REFERENCE_ATTEMPTS: usize = 3;

/// Reloads attempted by explicit transitions that lose a version race.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Currency initial followed by 12 upper-case hex digits, e.g. `B3F09A1C27D4E`.
pub fn generate_reference_code(currency: &str) -> String {
    let initial = currency
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('X');
    let random = Uuid::new_v4().simple().to_string();
    format!("{initial}{}", random[..12].to_ascii_uppercase())
}

/// A payment mutation staged in memory, written by [`PaymentLedger::commit`].
struct Staged {
    payment: Payment,
    events: Vec<WebhookEvent>,
    audit: Vec<AuditEntry>,
    transitions: Vec<PaymentStatus>,
    dirty: bool,
}

impl Staged {
    fn new(payment: Payment) -> Self {
        Self {
            payment,
            events: Vec::new(),
            audit: Vec::new(),
            transitions: Vec::new(),
            dirty: false,
        }
    }
}

pub struct PaymentLedger {
    config: PaymentsConfig,
    store: Arc<dyn PaymentRepository>,
    chains: ChainRegistry,
    rates: Arc<ExchangeRateCache>,
    webhooks: Arc<WebhookDispatcher>,
}

impl PaymentLedger {
    pub fn new(
        config: PaymentsConfig,
        store: Arc<dyn PaymentRepository>,
        chains: ChainRegistry,
        rates: Arc<ExchangeRateCache>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            config,
            store,
            chains,
            rates,
            webhooks,
        }
    }

    pub fn config(&self) -> &PaymentsConfig {
        &self.config
    }

    /// Create a payment for `amount_fiat` in `fiat_currency`, payable in
    /// `crypto_currency`. Rate lookup and address generation happen first;
    /// the payment row, address registration, `payment_created` events and
    /// audit row are then written in a single transaction.
    pub async fn create_payment_request(
        &self,
        amount_fiat: Decimal,
        fiat_currency: &str,
        crypto_currency: &str,
        options: PaymentOptions,
    ) -> Result<Payment> {
        let currency = crypto_currency.to_ascii_uppercase();
        let fiat = fiat_currency.to_ascii_uppercase();
        if !self.config.is_supported(&currency) {
            return Err(PaymentError::UnsupportedCurrency(currency));
        }
        let chain = self.chains.get(&currency)?;
        if amount_fiat <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "fiat amount must be positive, got {amount_fiat}"
            )));
        }
        let fee_percentage = options.fee_percentage.unwrap_or(Decimal::ZERO);
        if fee_percentage < Decimal::ZERO || fee_percentage > Decimal::ONE_HUNDRED {
            return Err(PaymentError::InvalidAmount(format!(
                "fee percentage out of range: {fee_percentage}"
            )));
        }
        let expiry_minutes = options
            .expires_in_minutes
            .unwrap_or(self.config.pending_expiry_minutes);
        let expiry = chrono::TimeDelta::try_minutes(expiry_minutes)
            .filter(|_| expiry_minutes > 0)
            .ok_or_else(|| {
                PaymentError::InvalidAmount(format!(
                    "expiry must be a positive number of minutes, got {expiry_minutes}"
                ))
            })?;
        let platform_fee = amount_fiat
            .checked_mul(fee_percentage)
            .and_then(|fee| fee.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| {
                PaymentError::InvalidAmount(format!("platform fee overflows for {amount_fiat}"))
            })?
            .round_dp(2);

        let exchange_rate = self.rates.get_rate(&currency, &fiat).await?;
        let amount_crypto = amount_fiat
            .checked_div(exchange_rate)
            .ok_or_else(|| PaymentError::RateUnavailable(format!("{currency}/{fiat}: zero rate")))?
            .round_dp(8);

        let wallet_address = chain.generate_address().await?;
        self.chains
            .ensure_valid_address(&currency, &wallet_address)
            .await?;

        let now = utc_now();
        let expires_at = now.checked_add_signed(expiry).ok_or_else(|| {
            PaymentError::InvalidAmount(format!("expiry of {expiry_minutes} minutes is out of range"))
        })?;

        let mut last_conflict = None;
        for _ in 0..MAX_REFERENCE_ATTEMPTS {
            let payment = Payment {
                id: Uuid::new_v4(),
                reference_code: generate_reference_code(&currency),
                merchant_id: options.merchant_id.clone(),
                order_id: options.order_id.clone(),
                description: options.description.clone(),
                payment_method: options.payment_method,
                currency: currency.clone(),
                amount_crypto,
                amount_fiat,
                fiat_currency: fiat.clone(),
                wallet_address: wallet_address.clone(),
                transaction_hash: None,
                status: PaymentStatus::Pending,
                confirmations: 0,
                required_confirmations: self.config.required_confirmations_for(&currency),
                exchange_rate,
                network_fee: None,
                platform_fee,
                fee_percentage,
                expires_at,
                paid_at: None,
                metadata: options.metadata.clone(),
                created_at: now,
                updated_at: now,
                version: 0,
            };

            let events = self.webhooks.prepare(&payment, EventType::PaymentCreated)?;
            let creation = PaymentCreation {
                address: AddressRegistration {
                    address: wallet_address.clone(),
                    currency: currency.clone(),
                    merchant_id: options.merchant_id.clone(),
                    label: format!("Payment {}", payment.reference_code),
                    is_active: true,
                },
                events,
                audit: vec![AuditEntry::new(
                    payment.id,
                    "payment_created",
                    json!({
                        "reference_code": payment.reference_code,
                        "amount_fiat": amount_fiat.to_string(),
                        "fiat_currency": fiat,
                        "amount_crypto": amount_crypto.to_string(),
                        "currency": currency,
                        "exchange_rate": exchange_rate.to_string(),
                    }),
                )],
                payment,
            };

            match self.store.create_payment(&creation) {
                Ok(()) => {
                    let payment = creation.payment;
                    metrics::PAYMENT_TRANSITIONS
                        .with_label_values(&[PaymentStatus::Pending.as_str()])
                        .inc();
                    tracing::info!(
                        payment_id = %payment.id,
                        reference = %payment.reference_code,
                        currency = %payment.currency,
                        amount_crypto = %payment.amount_crypto,
                        amount_fiat = %payment.amount_fiat,
                        "payment request created"
                    );
                    self.webhooks.enqueue(&creation.events).await;
                    return Ok(payment);
                }
                Err(PaymentError::Conflict(detail)) => {
                    tracing::warn!(detail = %detail, "reference code collision, regenerating");
                    last_conflict = Some(detail);
                }
                Err(e) => return Err(e),
            }
        }

        Err(PaymentError::Conflict(last_conflict.unwrap_or_else(|| {
            "could not allocate a unique reference code".to_string()
        })))
    }

    /// Advance `payment` from chain data. Never fails: errors are logged and
    /// the payment is returned as given, to be retried by a later call.
    pub async fn check_payment_status(&self, payment: &Payment) -> Payment {
        match self.try_check(payment).await {
            Ok(updated) => updated,
            Err(PaymentError::Conflict(detail)) => {
                tracing::debug!(payment_id = %payment.id, detail = %detail, "payment changed concurrently, deferring");
                payment.clone()
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(payment_id = %payment.id, error = %e, "payment status check failed, retrying next sweep");
                payment.clone()
            }
            Err(e) => {
                tracing::error!(payment_id = %payment.id, error = %e, "payment status check failed");
                payment.clone()
            }
        }
    }

    async fn try_check(&self, payment: &Payment) -> Result<Payment> {
        if payment.is_terminal() {
            return Ok(payment.clone());
        }
        let now = utc_now();
        let mut staged = Staged::new(payment.clone());

        if payment.status == PaymentStatus::Pending && payment.is_expired(now) {
            self.stage_transition(
                &mut staged,
                PaymentStatus::Expired,
                json!({ "expires_at": payment.expires_at.to_rfc3339() }),
            )?;
            return self.commit(staged).await;
        }

        let chain = self.chains.get(&payment.currency)?;
        let tx_hash = match &payment.transaction_hash {
            Some(hash) => hash.clone(),
            None => match chain.find_incoming_transaction(payment).await? {
                Some(hash) => {
                    tracing::info!(payment_id = %payment.id, tx = %hash, "incoming transaction detected");
                    staged.payment.transaction_hash = Some(hash.clone());
                    staged.payment.updated_at = now;
                    staged.audit.push(AuditEntry::new(
                        payment.id,
                        "transaction_detected",
                        json!({ "transaction_hash": hash }),
                    ));
                    staged.dirty = true;
                    hash
                }
                None => return Ok(payment.clone()),
            },
        };

        let observed = chain.get_confirmations(&tx_hash).await?;
        if staged.payment.observe_confirmations(observed) {
            staged.payment.updated_at = now;
            staged.dirty = true;
        }

        if staged.payment.confirmations > 0 && staged.payment.status == PaymentStatus::Pending {
            let details = json!({ "confirmations": staged.payment.confirmations });
            self.stage_transition(&mut staged, PaymentStatus::Confirming, details)?;
        }
        if staged.payment.is_confirmed()
            && staged
                .payment
                .status
                .can_transition_to(PaymentStatus::Confirmed)
        {
            let details = json!({
                "confirmations": staged.payment.confirmations,
                "required_confirmations": staged.payment.required_confirmations,
            });
            self.stage_transition(&mut staged, PaymentStatus::Confirmed, details)?;
        }

        if !staged.dirty {
            return Ok(payment.clone());
        }
        self.commit(staged).await
    }

    /// Mark a confirmed payment as settled. Repeating the call is a no-op.
    pub async fn complete_payment(&self, payment_id: Uuid) -> Result<Payment> {
        self.explicit_transition(payment_id, PaymentStatus::Completed, json!({}))
            .await
    }

    /// Refund any non-terminal payment. Repeating the call is a no-op.
    pub async fn refund_payment(&self, payment_id: Uuid, reason: Option<&str>) -> Result<Payment> {
        self.explicit_transition(
            payment_id,
            PaymentStatus::Refunded,
            json!({ "reason": reason }),
        )
        .await
    }

    /// Fail any non-terminal payment. Repeating the call is a no-op.
    pub async fn fail_payment(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        self.explicit_transition(
            payment_id,
            PaymentStatus::Failed,
            json!({ "reason": reason }),
        )
        .await
    }

    async fn explicit_transition(
        &self,
        payment_id: Uuid,
        target: PaymentStatus,
        details: Value,
    ) -> Result<Payment> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let payment = self.get_payment(payment_id)?;
            if payment.status == target {
                return Ok(payment);
            }

            let mut staged = Staged::new(payment);
            self.stage_transition(&mut staged, target, details.clone())?;
            match self.commit(staged).await {
                Err(PaymentError::Conflict(_)) if attempt < MAX_CONFLICT_RETRIES => continue,
                other => return other,
            }
        }
    }

    pub fn get_payment(&self, payment_id: Uuid) -> Result<Payment> {
        self.store
            .get_payment(payment_id)?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {payment_id}")))
    }

    pub fn find_by_reference(&self, reference_code: &str) -> Result<Payment> {
        self.store
            .find_by_reference(reference_code)?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {reference_code}")))
    }

    pub fn audit_trail(&self, payment_id: Uuid) -> Result<Vec<AuditEntry>> {
        self.store.audit_trail(payment_id)
    }

    /// Hide a payment from reads and reconciliation.
    pub fn delete_payment(&self, payment_id: Uuid) -> Result<()> {
        self.store.soft_delete_payment(payment_id)?;
        tracing::info!(payment_id = %payment_id, "payment deleted");
        Ok(())
    }

    fn stage_transition(
        &self,
        staged: &mut Staged,
        target: PaymentStatus,
        details: Value,
    ) -> Result<()> {
        let from = staged.payment.status;
        staged.payment.transition_to(target, utc_now())?;

        if let Some(event_type) = EventType::for_status(target) {
            let events = self.webhooks.prepare(&staged.payment, event_type)?;
            staged.events.extend(events);
        }

        let mut changes = json!({ "from": from.as_str(), "to": target.as_str() });
        if let (Some(changes), Value::Object(extra)) = (changes.as_object_mut(), details) {
            changes.extend(extra);
        }
        let action = match target {
            PaymentStatus::Completed => "payment_completed",
            PaymentStatus::Refunded => "refund_initiated",
            PaymentStatus::Failed => "payment_failed",
            PaymentStatus::Expired => "payment_expired",
            _ => "status_changed",
        };
        staged
            .audit
            .push(AuditEntry::new(staged.payment.id, action, changes));
        staged.transitions.push(target);
        staged.dirty = true;
        Ok(())
    }

    async fn commit(&self, staged: Staged) -> Result<Payment> {
        let Staged {
            payment,
            events,
            audit,
            transitions,
            ..
        } = staged;

        let change = PaymentChange {
            payment,
            events,
            audit,
        };
        let saved = self.store.save_payment(&change)?;

        for status in &transitions {
            metrics::PAYMENT_TRANSITIONS
                .with_label_values(&[status.as_str()])
                .inc();
            tracing::info!(
                payment_id = %saved.id,
                reference = %saved.reference_code,
                status = %status,
                confirmations = saved.confirmations,
                "payment status changed"
            );
        }
        self.webhooks.enqueue(&change.events).await;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::fixture;
    use crate::store::WebhookRepository;
    use crate::queue::TaskQueue;
    use rust_decimal_macros::dec;

    fn merchant_options() -> PaymentOptions {
        PaymentOptions {
            merchant_id: Some("m1".into()),
            ..PaymentOptions::default()
        }
    }

    #[test]
    fn reference_code_shape() {
        let code = generate_reference_code("btc");
        assert_eq!(code.len(), 13);
        assert!(code.starts_with('B'));
        assert!(code[1..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_ne!(code, generate_reference_code("btc"));
    }

    #[tokio::test]
    async fn create_converts_fiat_at_current_rate() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(
                dec!(100),
                "usd",
                "btc",
                PaymentOptions {
                    fee_percentage: Some(dec!(1.5)),
                    ..merchant_options()
                },
            )
            .await
            .unwrap();

        assert_eq!(payment.amount_crypto, dec!(0.002));
        assert_eq!(payment.exchange_rate, dec!(50000));
        assert_eq!(payment.platform_fee, dec!(1.50));
        assert_eq!(payment.amount_received(), dec!(98.50));
        assert_eq!(payment.currency, "BTC");
        assert_eq!(payment.fiat_currency, "USD");
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.required_confirmations, 3);
        assert_eq!(
            (payment.expires_at - payment.created_at).num_minutes(),
            15
        );

        let stored = f.ledger.get_payment(payment.id).unwrap();
        assert_eq!(stored, payment);
        assert!(f
            .db
            .address(&payment.wallet_address, "BTC")
            .unwrap()
            .is_some());
        let trail = f.ledger.audit_trail(payment.id).unwrap();
        assert_eq!(trail[0].action, "payment_created");
    }

    #[tokio::test]
    async fn create_emits_one_created_event_per_endpoint() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        f.dispatcher
            .register_endpoint("m1", "https://m1.example/hook", vec!["payment_created".into()], None)
            .unwrap();

        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        let events = f.db.events_for_payment(payment.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "payment_created");
        assert_eq!(events[0].payload["payment"]["reference_code"], payment.reference_code.as_str());
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn create_failures_leave_no_trace() {
        let f = fixture(PaymentsConfig::default(), None);
        let err = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::RateUnavailable(_)));

        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        f.chain.set_failing(true);
        let err = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ChainCommunication(_)));

        for table in ["payments", "crypto_addresses", "webhook_events", "audit_logs"] {
            assert_eq!(f.count_rows(table), 0, "{table}");
        }
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        assert!(matches!(
            f.ledger
                .create_payment_request(dec!(100), "USD", "DOGE", merchant_options())
                .await,
            Err(PaymentError::UnsupportedCurrency(_))
        ));
        // Supported in config but no chain client registered.
        assert!(matches!(
            f.ledger
                .create_payment_request(dec!(100), "USD", "ETH", merchant_options())
                .await,
            Err(PaymentError::UnsupportedCurrency(_))
        ));
        assert!(matches!(
            f.ledger
                .create_payment_request(dec!(0), "USD", "BTC", merchant_options())
                .await,
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_unusable_expiry_and_fee() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        for minutes in [0, -5, i64::MAX] {
            let err = f
                .ledger
                .create_payment_request(
                    dec!(100),
                    "USD",
                    "BTC",
                    PaymentOptions {
                        expires_in_minutes: Some(minutes),
                        ..merchant_options()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, PaymentError::InvalidAmount(_)), "{minutes}");
        }

        let err = f
            .ledger
            .create_payment_request(
                Decimal::MAX,
                "USD",
                "BTC",
                PaymentOptions {
                    fee_percentage: Some(dec!(50)),
                    ..merchant_options()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAmount(_)));

        for table in ["payments", "crypto_addresses", "audit_logs"] {
            assert_eq!(f.count_rows(table), 0, "{table}");
        }
    }

    #[tokio::test]
    async fn one_transaction_can_pay_several_payments() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let first = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        let second = f
            .ledger
            .create_payment_request(dec!(40), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        f.chain.set_incoming(Some("batched-tx"));
        f.chain.set_confirmations(3);
        let first = f.ledger.check_payment_status(&first).await;
        let second = f.ledger.check_payment_status(&second).await;

        for payment in [first, second] {
            assert_eq!(payment.status, PaymentStatus::Confirmed);
            assert_eq!(payment.transaction_hash.as_deref(), Some("batched-tx"));
            assert_eq!(f.ledger.get_payment(payment.id).unwrap(), payment);
        }
    }

    #[tokio::test]
    async fn confirmations_drive_status_forward() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        // Nothing on chain yet: no write at all.
        let unchanged = f.ledger.check_payment_status(&payment).await;
        assert_eq!(unchanged.version, payment.version);

        f.chain.set_incoming(Some("tx-abc"));
        f.chain.set_confirmations(1);
        let confirming = f.ledger.check_payment_status(&payment).await;
        assert_eq!(confirming.status, PaymentStatus::Confirming);
        assert_eq!(confirming.transaction_hash.as_deref(), Some("tx-abc"));
        assert_eq!(confirming.confirmations, 1);

        f.chain.set_confirmations(2);
        let still = f.ledger.check_payment_status(&confirming).await;
        assert_eq!(still.status, PaymentStatus::Confirming);
        assert_eq!(still.confirmations, 2);

        f.chain.set_confirmations(3);
        let confirmed = f.ledger.check_payment_status(&still).await;
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
        assert_eq!(f.ledger.get_payment(payment.id).unwrap(), confirmed);
    }

    #[tokio::test]
    async fn confirmations_never_go_backwards() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        f.chain.set_incoming(Some("tx-1"));
        f.chain.set_confirmations(2);
        let seen = f.ledger.check_payment_status(&payment).await;
        assert_eq!(seen.confirmations, 2);

        // Reorg: the node now reports fewer confirmations.
        f.chain.set_confirmations(1);
        let after = f.ledger.check_payment_status(&seen).await;
        assert_eq!(after.confirmations, 2);
        assert_eq!(f.ledger.get_payment(payment.id).unwrap().confirmations, 2);
    }

    #[tokio::test]
    async fn chain_errors_are_swallowed() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        f.chain.set_failing(true);
        let same = f.ledger.check_payment_status(&payment).await;
        assert_eq!(same, payment);
    }

    #[tokio::test]
    async fn stale_copy_loses_the_race() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        f.chain.set_incoming(Some("tx-1"));
        f.chain.set_confirmations(1);
        let first = f.ledger.check_payment_status(&payment).await;
        assert_eq!(first.status, PaymentStatus::Confirming);

        // A second checker still holding version 0 must not write.
        f.chain.set_confirmations(5);
        let stale = f.ledger.check_payment_status(&payment).await;
        assert_eq!(stale.version, payment.version);
        let stored = f.ledger.get_payment(payment.id).unwrap();
        assert_eq!(stored.version, first.version);
        assert_eq!(stored.confirmations, 1);
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_guarded() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        assert!(matches!(
            f.ledger.complete_payment(payment.id).await,
            Err(PaymentError::InvalidTransition {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Completed
            })
        ));

        f.chain.set_incoming(Some("tx-1"));
        f.chain.set_confirmations(3);
        f.ledger.check_payment_status(&payment).await;

        let completed = f.ledger.complete_payment(payment.id).await.unwrap();
        assert_eq!(completed.status, PaymentStatus::Completed);
        assert!(completed.paid_at.is_some());
        let again = f.ledger.complete_payment(payment.id).await.unwrap();
        assert_eq!(again.version, completed.version);

        assert!(matches!(
            f.ledger.refund_payment(payment.id, Some("late")).await,
            Err(PaymentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn refund_records_reason_and_event() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        f.dispatcher
            .register_endpoint("m1", "https://m1.example/hook", vec!["payment_refunded".into()], None)
            .unwrap();
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        let refunded = f
            .ledger
            .refund_payment(payment.id, Some("customer request"))
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        f.ledger
            .refund_payment(payment.id, Some("customer request"))
            .await
            .unwrap();

        let trail = f.ledger.audit_trail(payment.id).unwrap();
        let refund = trail.iter().find(|e| e.action == "refund_initiated").unwrap();
        assert_eq!(refund.changes["reason"], "customer request");
        assert_eq!(refund.changes["from"], "pending");

        let events = f.db.events_for_payment(payment.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "payment_refunded");
        assert_eq!(events[0].payload["payment"]["status"], "refunded");

        // Terminal: chain activity no longer changes anything.
        f.chain.set_incoming(Some("tx-late"));
        f.chain.set_confirmations(10);
        let checked = f.ledger.check_payment_status(&refunded).await;
        assert_eq!(checked, refunded);
    }

    #[tokio::test]
    async fn fail_moves_to_failed() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        let failed = f.ledger.fail_payment(payment.id, "underpaid").await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(matches!(
            f.ledger.complete_payment(payment.id).await,
            Err(PaymentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn deleted_payments_are_hidden() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();
        f.ledger.delete_payment(payment.id).unwrap();
        assert!(matches!(
            f.ledger.get_payment(payment.id),
            Err(PaymentError::NotFound(_))
        ));
        assert!(matches!(
            f.ledger.find_by_reference(&payment.reference_code),
            Err(PaymentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn queued_jobs_match_persisted_events() {
        let f = fixture(PaymentsConfig::default(), Some(dec!(50000)));
        f.dispatcher
            .register_endpoint("m1", "https://a.example/hook", vec!["payment_created".into()], None)
            .unwrap();
        f.dispatcher
            .register_endpoint("m1", "https://b.example/hook", vec!["payment_created".into()], None)
            .unwrap();
        let payment = f
            .ledger
            .create_payment_request(dec!(100), "USD", "BTC", merchant_options())
            .await
            .unwrap();

        let mut persisted: Vec<Uuid> = f
            .db
            .events_for_payment(payment.id)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut queued = vec![
            f.queue.pop().await.unwrap().event_id,
            f.queue.pop().await.unwrap().event_id,
        ];
        persisted.sort();
        queued.sort();
        assert_eq!(persisted, queued);
    }
}
