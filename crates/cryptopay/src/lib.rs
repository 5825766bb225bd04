//! Crypto payment lifecycle tracking.
//!
//! A payment is priced in fiat, converted to crypto at a cached exchange rate,
//! assigned a fresh on-chain receiving address, and then followed through
//! `pending -> confirming -> confirmed -> completed` as confirmations arrive.
//! Every state change is persisted together with its audit entries and its
//! outbound webhook events, then delivered with HMAC signatures and retries.
//!
//! # Modules
//!
//! - [`ledger`]: payment creation, status checks and explicit transitions
//! - [`reconciler`]: periodic sweep re-checking live payments against the chain
//! - [`chain`]: [`ChainClient`](chain::ChainClient) capability with Bitcoin and Ethereum clients
//! - [`rates`]: CoinGecko provider and the layered [`ExchangeRateCache`](rates::ExchangeRateCache)
//! - [`webhook`]: endpoint registry, event fan-out and the delivery worker pool
//! - [`queue`]: delayed delivery job queue
//! - [`store`]: repository traits and their SQLite implementation
//! - [`hmac`]: webhook payload signing and verification
//! - [`metrics`]: Prometheus counters for transitions, deliveries and sweeps

pub mod chain;
pub mod config;
pub mod error;
pub mod hmac;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod rates;
pub mod reconciler;
pub mod security;
pub mod store;
pub mod types;
pub mod webhook;

#[cfg(test)]
mod fixtures;

pub use config::PaymentsConfig;
pub use error::{PaymentError, Result};
pub use ledger::PaymentLedger;
pub use reconciler::ConfirmationReconciler;
pub use store::Database;
pub use types::{EventType, Payment, PaymentStatus};
