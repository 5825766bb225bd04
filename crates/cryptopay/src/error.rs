use thiserror::Error;

use crate::types::PaymentStatus;

/// Errors returned by cryptopay operations.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("exchange rate unavailable: {0}")]
    RateUnavailable(String),

    #[error("chain communication error: {0}")]
    ChainCommunication(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("webhook delivery failed: {0}")]
    WebhookDelivery(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid webhook endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic version check failed; another writer got there first.
    #[error("concurrent modification of {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// True when the error comes from talking to a node or rate provider and a
    /// later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PaymentError::ChainCommunication(_)
                | PaymentError::RateUnavailable(_)
                | PaymentError::Conflict(_)
        )
    }
}

pub type Result<T, E = PaymentError> = std::result::Result<T, E>;
