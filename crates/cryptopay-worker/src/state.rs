use std::sync::Arc;

use cryptopay::webhook::WebhookDispatcher;
use cryptopay::{Database, PaymentLedger};

/// Shared application state for the worker's HTTP surface.
pub struct AppState {
    pub db: Database,
    pub ledger: Arc<PaymentLedger>,
    pub dispatcher: Arc<WebhookDispatcher>,
    /// Bearer token for /metrics.
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
}
