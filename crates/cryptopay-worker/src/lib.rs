//! cryptopay worker service.
//!
//! Hosts the long-running parts of [`cryptopay`]: the confirmation
//! reconciler, the webhook delivery pool and the exchange-rate refresher,
//! plus a small HTTP surface for health checks and Prometheus scraping.
//!
//! # Modules
//!
//! - [`config`]: [`ServiceConfig`](config::ServiceConfig) loaded from the environment
//! - [`bootstrap`]: wires the store, chains, rates, webhooks and ledger together
//! - [`state`]: shared [`AppState`](state::AppState) for the HTTP handlers
//! - [`routes`]: `/health` and `/metrics`

pub mod bootstrap;
pub mod config;
pub mod routes;
pub mod state;
