//! Blockchain access as a capability interface.
//!
//! - [`ChainClient`]: what the ledger needs from a node: addresses,
//!   confirmation depth, and correlation of incoming transfers
//! - [`ChainRegistry`]: selects a client by currency symbol
//! - [`bitcoin::BitcoinClient`]: Bitcoin Core JSON-RPC
//! - [`ethereum::EthereumClient`]: any alloy [`Provider`](alloy::providers::Provider)

pub mod bitcoin;
pub mod ethereum;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PaymentError, Result};
use crate::types::Payment;

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Upper-case symbol this client serves (e.g. "BTC").
    fn currency(&self) -> &str;

    /// Ask the node for a fresh receiving address.
    async fn generate_address(&self) -> Result<String>;

    /// Check that `address` is well-formed for this chain.
    async fn validate_address(&self, address: &str) -> Result<bool>;

    /// Current confirmation depth of `tx_hash`; 0 when unknown or unmined.
    async fn get_confirmations(&self, tx_hash: &str) -> Result<u32>;

    /// Find a transfer to the payment's address covering its amount.
    async fn find_incoming_transaction(&self, payment: &Payment) -> Result<Option<String>>;
}

/// Currency symbol -> chain client.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: HashMap<String, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under its own currency symbol.
    pub fn register(&mut self, client: Arc<dyn ChainClient>) {
        let symbol = client.currency().to_ascii_uppercase();
        tracing::info!(currency = %symbol, "chain client registered");
        self.clients.insert(symbol, client);
    }

    pub fn with(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, currency: &str) -> Result<Arc<dyn ChainClient>> {
        self.clients
            .get(&currency.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| PaymentError::UnsupportedCurrency(currency.to_string()))
    }

    /// Validate an address for `currency`, mapping a negative answer to
    /// [`PaymentError::InvalidAddress`].
    pub async fn ensure_valid_address(&self, currency: &str, address: &str) -> Result<()> {
        if self.get(currency)?.validate_address(address).await? {
            Ok(())
        } else {
            Err(PaymentError::InvalidAddress(address.to_string()))
        }
    }

    pub fn currencies(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.clients.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}
