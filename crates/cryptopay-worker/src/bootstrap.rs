//! Wire the cryptopay components into a running service.
//!
//! Opens the SQLite store, registers the configured chain clients, builds
//! the rate cache, webhook dispatcher and ledger, then starts the background
//! tasks: webhook delivery workers (after re-enqueueing pending events), the
//! confirmation reconciler and the rate refresher.

use std::sync::Arc;
use std::time::Duration;

use alloy::providers::ProviderBuilder;
use cryptopay::chain::bitcoin::BitcoinClient;
use cryptopay::chain::ethereum::EthereumClient;
use cryptopay::chain::ChainRegistry;
use cryptopay::config::{ConfigError, PaymentsConfig};
use cryptopay::queue::{MemoryQueue, TaskQueue};
use cryptopay::rates::{CoinGeckoProvider, ExchangeRateCache};
use cryptopay::webhook::{DeliveryWorker, WebhookDispatcher};
use cryptopay::{ConfirmationReconciler, Database, PaymentError, PaymentLedger};

use crate::config::ServiceConfig;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// The assembled service: shared state plus handles to its background tasks.
pub struct Service {
    pub state: Arc<AppState>,
    pub queue: Arc<dyn TaskQueue>,
    pub tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Service {
    /// Stop handing out delivery jobs and abort the periodic tasks.
    pub fn shutdown(self) {
        self.queue.close();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Build the chain registry from whichever RPC endpoints are configured.
pub fn build_chains(config: &PaymentsConfig) -> Result<ChainRegistry, BootstrapError> {
    let mut chains = ChainRegistry::new();

    if let Some(btc) = &config.bitcoin {
        chains.register(Arc::new(BitcoinClient::new(btc)?));
    }
    if let Some(eth) = &config.ethereum {
        let url: url::Url = eth
            .rpc_url
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(eth.rpc_url.clone()))?;
        let provider = ProviderBuilder::new().connect_http(url);
        chains.register(Arc::new(
            EthereumClient::new(provider, Duration::from_secs(eth.timeout_secs))
                .with_scan_depth(eth.scan_blocks),
        ));
    }

    for currency in &config.supported_currencies {
        if chains.get(currency).is_err() {
            tracing::warn!(currency = %currency, "supported currency has no chain client; payment creation will fail");
        }
    }
    Ok(chains)
}

/// Assemble the service and start its background tasks.
pub async fn bootstrap(config: &ServiceConfig) -> Result<Service, BootstrapError> {
    let payments = config.payments.clone();

    let db = Database::new(&config.db_path)?;
    tracing::info!(path = %config.db_path, "payment store opened");

    let queue = Arc::new(MemoryQueue::new());
    let chains = build_chains(&payments)?;

    let rates = Arc::new(ExchangeRateCache::new(
        Arc::new(db.clone()),
        Arc::new(CoinGeckoProvider::new(&payments.rates)?),
        Duration::from_secs(payments.rates.ttl_secs),
    ));

    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::new(db.clone()),
        queue.clone(),
        payments.webhooks.clone(),
    ));

    let ledger = Arc::new(PaymentLedger::new(
        payments.clone(),
        Arc::new(db.clone()),
        chains.clone(),
        rates.clone(),
        dispatcher.clone(),
    ));

    let mut tasks = Vec::new();

    let worker = Arc::new(DeliveryWorker::new(
        Arc::new(db.clone()),
        queue.clone(),
        payments.webhooks.clone(),
    )?);
    worker.recover().await?;
    tasks.extend(worker.spawn_workers(payments.webhooks.workers));
    tracing::info!(workers = payments.webhooks.workers, "webhook delivery workers started");

    let reconciler = Arc::new(ConfirmationReconciler::new(
        ledger.clone(),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        payments.reconciler.clone(),
    ));
    tasks.push(reconciler.spawn());
    tracing::info!(
        interval_secs = payments.reconciler.interval_secs,
        batch_size = payments.reconciler.batch_size,
        "confirmation reconciler started"
    );

    tasks.push(rates.start_refresher(
        chains.currencies(),
        payments.rates.tracked_fiat.clone(),
        Duration::from_secs(payments.rates.refresh_interval_secs.max(1)),
    ));

    let state = Arc::new(AppState {
        db,
        ledger,
        dispatcher,
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
    });

    Ok(Service {
        state,
        queue,
        tasks,
    })
}
