#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use cryptopay::chain::{ChainClient, ChainRegistry};
use cryptopay::queue::MemoryQueue;
use cryptopay::rates::{ExchangeRateCache, RateProvider, RateQuote};
use cryptopay::reconciler::ConfirmationReconciler;
use cryptopay::types::{utc_now, EventType, Payment, PaymentOptions};
use cryptopay::webhook::{DeliveryWorker, WebhookDispatcher};
use cryptopay::{Database, PaymentError, PaymentLedger, PaymentsConfig, Result};

/// A node whose answers are set by the test.
pub struct ScriptedChain {
    issued: AtomicU32,
    incoming: Mutex<Option<String>>,
    confirmations: AtomicU32,
    down: AtomicBool,
}

impl ScriptedChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicU32::new(0),
            incoming: Mutex::new(None),
            confirmations: AtomicU32::new(0),
            down: AtomicBool::new(false),
        })
    }

    pub fn pay(&self, tx: &str, confirmations: u32) {
        *self.incoming.lock().unwrap() = Some(tx.to_string());
        self.confirmations.store(confirmations, Ordering::SeqCst);
    }

    pub fn confirm(&self, confirmations: u32) {
        self.confirmations.store(confirmations, Ordering::SeqCst);
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    fn up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PaymentError::ChainCommunication("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    fn currency(&self) -> &str {
        "BTC"
    }

    async fn generate_address(&self) -> Result<String> {
        self.up()?;
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bcrt1qscripted{n:04}"))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        Ok(address.starts_with("bcrt1q"))
    }

    async fn get_confirmations(&self, _tx_hash: &str) -> Result<u32> {
        self.up()?;
        Ok(self.confirmations.load(Ordering::SeqCst))
    }

    async fn find_incoming_transaction(&self, _payment: &Payment) -> Result<Option<String>> {
        self.up()?;
        Ok(self.incoming.lock().unwrap().clone())
    }
}

pub struct StaticRate(pub Decimal);

#[async_trait]
impl RateProvider for StaticRate {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_rate(&self, _crypto: &str, _fiat: &str) -> Result<RateQuote> {
        Ok(RateQuote::new(self.0))
    }
}

pub struct Harness {
    pub db: Database,
    pub queue: Arc<MemoryQueue>,
    pub chain: Arc<ScriptedChain>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub ledger: Arc<PaymentLedger>,
    pub reconciler: ConfirmationReconciler,
}

pub fn harness(config: PaymentsConfig) -> Harness {
    let db = Database::new(":memory:").unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let chain = ScriptedChain::new();
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::new(db.clone()),
        queue.clone(),
        config.webhooks.clone(),
    ));
    let rates = Arc::new(ExchangeRateCache::new(
        Arc::new(db.clone()),
        Arc::new(StaticRate(Decimal::from(50_000))),
        Duration::from_secs(config.rates.ttl_secs),
    ));
    let reconciler_config = config.reconciler.clone();
    let ledger = Arc::new(PaymentLedger::new(
        config,
        Arc::new(db.clone()),
        ChainRegistry::new().with(chain.clone()),
        rates,
        dispatcher.clone(),
    ));
    let reconciler = ConfirmationReconciler::new(
        ledger.clone(),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        reconciler_config,
    );
    Harness {
        db,
        queue,
        chain,
        dispatcher,
        ledger,
        reconciler,
    }
}

impl Harness {
    pub async fn create(&self, merchant_id: Option<&str>) -> Payment {
        self.ledger
            .create_payment_request(
                Decimal::from(100),
                "USD",
                "BTC",
                PaymentOptions {
                    merchant_id: merchant_id.map(str::to_string),
                    ..PaymentOptions::default()
                },
            )
            .await
            .unwrap()
    }

    pub fn worker(&self, config: &PaymentsConfig) -> Arc<DeliveryWorker> {
        Arc::new(
            DeliveryWorker::new(
                Arc::new(self.db.clone()),
                self.queue.clone(),
                config.webhooks.clone(),
            )
            .unwrap(),
        )
    }

    /// Push a payment's expiry `minutes` into the past.
    pub fn backdate_expiry(&self, payment_id: Uuid, minutes: i64) {
        let at = (utc_now() - chrono::Duration::minutes(minutes)).timestamp_millis();
        self.db
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE payments SET expires_at = ?1 WHERE id = ?2",
                    rusqlite::params![at, payment_id.to_string()],
                )
            })
            .unwrap();
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.db
            .with_connection(|conn| conn.query_row(sql, [], |row| row.get(0)))
            .unwrap()
    }
}

/// Every lifecycle event an endpoint can subscribe to.
pub fn all_events() -> Vec<String> {
    [
        EventType::PaymentCreated,
        EventType::PaymentConfirming,
        EventType::PaymentConfirmed,
        EventType::PaymentCompleted,
        EventType::PaymentFailed,
        EventType::PaymentExpired,
        EventType::PaymentRefunded,
    ]
    .iter()
    .map(|e| e.as_str().to_string())
    .collect()
}

/// Poll `check` every 20ms until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
