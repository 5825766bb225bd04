use std::env;

use cryptopay::config::ConfigError;
use cryptopay::PaymentsConfig;

const DEFAULT_PORT: u16 = 4030;
const DEFAULT_DB_PATH: &str = "./cryptopay.db";

/// Everything the worker binary needs at startup.
#[derive(Clone)]
pub struct ServiceConfig {
    pub payments: PaymentsConfig,
    pub db_path: String,
    pub port: u16,
    /// Bearer token guarding `/metrics`.
    pub metrics_token: Option<Vec<u8>>,
    /// Serve `/metrics` without a token when none is configured.
    pub public_metrics: bool,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("payments", &self.payments)
            .field("db_path", &self.db_path)
            .field("port", &self.port)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .finish()
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let payments = PaymentsConfig::from_env()?;

        let db_path = env::var("CRYPTOPAY_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        if db_path.trim().is_empty() {
            return Err(ConfigError::MissingRequired("CRYPTOPAY_DB_PATH"));
        }

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("PORT={raw}")))?,
            Err(_) => DEFAULT_PORT,
        };

        let metrics_token = env::var("METRICS_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);
        let public_metrics = env::var("CRYPTOPAY_PUBLIC_METRICS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            payments,
            db_path,
            port,
            metrics_token,
            public_metrics,
        })
    }
}
