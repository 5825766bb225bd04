//! Shared test doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::chain::{ChainClient, ChainRegistry};
use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::ledger::PaymentLedger;
use crate::queue::MemoryQueue;
use crate::rates::{ExchangeRateCache, RateProvider, RateQuote};
use crate::store::Database;
use crate::types::{utc_now, Payment, PaymentMethod, PaymentStatus};
use crate::webhook::WebhookDispatcher;

/// Scriptable chain: tests set what the "node" reports next.
pub struct MockChain {
    symbol: &'static str,
    issued: AtomicU32,
    incoming: Mutex<Option<String>>,
    confirmations: AtomicU32,
    failing: AtomicBool,
}

impl MockChain {
    pub fn new(symbol: &'static str) -> Arc<Self> {
        Arc::new(Self {
            symbol,
            issued: AtomicU32::new(0),
            incoming: Mutex::new(None),
            confirmations: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_incoming(&self, tx: Option<&str>) {
        *self.incoming.lock().unwrap() = tx.map(str::to_string);
    }

    pub fn set_confirmations(&self, n: u32) {
        self.confirmations.store(n, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PaymentError::ChainCommunication("node unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn currency(&self) -> &str {
        self.symbol
    }

    async fn generate_address(&self) -> Result<String> {
        self.check()?;
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock{}addr{n}", self.symbol.to_ascii_lowercase()))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        Ok(address.starts_with("mock"))
    }

    async fn get_confirmations(&self, _tx_hash: &str) -> Result<u32> {
        self.check()?;
        Ok(self.confirmations.load(Ordering::SeqCst))
    }

    async fn find_incoming_transaction(&self, _payment: &Payment) -> Result<Option<String>> {
        self.check()?;
        Ok(self.incoming.lock().unwrap().clone())
    }
}

/// Provider answering every pair with the same rate, or failing when `None`.
pub struct FixedRates(pub Option<Decimal>);

#[async_trait]
impl RateProvider for FixedRates {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch_rate(&self, crypto: &str, fiat: &str) -> Result<RateQuote> {
        self.0
            .map(RateQuote::new)
            .ok_or_else(|| PaymentError::RateUnavailable(format!("{crypto}/{fiat}")))
    }
}

pub struct Fixture {
    pub db: Database,
    pub queue: Arc<MemoryQueue>,
    pub chain: Arc<MockChain>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub ledger: Arc<PaymentLedger>,
}

pub fn fixture(config: PaymentsConfig, rate: Option<Decimal>) -> Fixture {
    let db = Database::new(":memory:").unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let chain = MockChain::new("BTC");
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::new(db.clone()),
        queue.clone(),
        config.webhooks.clone(),
    ));
    let rates = Arc::new(ExchangeRateCache::new(
        Arc::new(db.clone()),
        Arc::new(FixedRates(rate)),
        Duration::from_secs(config.rates.ttl_secs),
    ));
    let ledger = Arc::new(PaymentLedger::new(
        config,
        Arc::new(db.clone()),
        ChainRegistry::new().with(chain.clone()),
        rates,
        dispatcher.clone(),
    ));
    Fixture {
        db,
        queue,
        chain,
        dispatcher,
        ledger,
    }
}

impl Fixture {
    /// Move a payment's expiry `minutes` into the past.
    pub fn expire(&self, payment_id: Uuid, minutes: i64) {
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

    pub fn count_rows(&self, table: &str) -> i64 {
        self.db
            .with_connection(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            })
            .unwrap()
    }
}

/// A fresh pending payment of `amount` to `address`, as chain clients see it.
pub fn payment_to(currency: &str, address: &str, amount: Decimal) -> Payment {
    let now = utc_now();
    Payment {
        id: Uuid::new_v4(),
        reference_code: format!("{}TEST", &currency[..1]),
        merchant_id: None,
        order_id: None,
        description: None,
        payment_method: PaymentMethod::Native,
        currency: currency.to_string(),
        amount_crypto: amount,
        amount_fiat: Decimal::ONE_HUNDRED,
        fiat_currency: "USD".into(),
        wallet_address: address.to_string(),
        transaction_hash: None,
        status: PaymentStatus::Pending,
        confirmations: 0,
        required_confirmations: 3,
        exchange_rate: Decimal::from(50_000),
        network_fee: None,
        platform_fee: Decimal::ZERO,
        fee_percentage: Decimal::ZERO,
        expires_at: now + chrono::Duration::minutes(15),
        paid_at: None,
        metadata: serde_json::Map::new(),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}
