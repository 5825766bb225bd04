//! Core configuration. Built once at startup and handed to each component.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use url::Url;

pub const DEFAULT_RATE_API_URL: &str = "https://api.coingecko.com/api/v3";
const DEFAULT_PENDING_MINUTES: i64 = 15;
const DEFAULT_CONFIRMING_MINUTES: i64 = 60;
const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 2;

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    /// Upper-case crypto symbols accepted for new payments.
    pub supported_currencies: Vec<String>,
    /// Required confirmation depth per symbol.
    pub required_confirmations: HashMap<String, u32>,
    /// Minutes a pending payment waits for funds before expiring.
    pub pending_expiry_minutes: i64,
    /// Extra minutes a confirming payment keeps being reconciled past `expires_at`.
    pub confirming_timeout_minutes: i64,
    pub webhooks: WebhookConfig,
    pub rates: RateConfig,
    pub reconciler: ReconcilerConfig,
    pub bitcoin: Option<BitcoinRpcConfig>,
    pub ethereum: Option<EthereumRpcConfig>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    /// Per-attempt HTTP timeout.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub retry_delay_secs: u64,
    /// Consecutive failed events before an endpoint is deactivated.
    pub failure_threshold: u32,
    /// Size of the delivery worker pool.
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct RateConfig {
    pub ttl_secs: u64,
    pub api_url: String,
    pub request_timeout_secs: u64,
    /// Fiat codes refreshed by the periodic rate sweep.
    pub tracked_fiat: Vec<String>,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Lease length for the fleet-wide sweep lock.
    pub lock_ttl_secs: u64,
}

#[derive(Clone)]
pub struct BitcoinRpcConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for BitcoinRpcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitcoinRpcConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EthereumRpcConfig {
    pub rpc_url: String,
    pub timeout_secs: u64,
    /// Recent blocks searched for an incoming transfer.
    pub scan_blocks: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_secs: 60,
            failure_threshold: 5,
            workers: 4,
        }
    }
}

impl WebhookConfig {
    /// Backoff before the attempt following `attempt`: `base * 2^(attempt-1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        Duration::from_secs(self.retry_delay_secs.saturating_mul(1u64 << exp))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            api_url: DEFAULT_RATE_API_URL.to_string(),
            request_timeout_secs: 10,
            tracked_fiat: vec!["USD".into(), "EUR".into(), "GBP".into()],
            refresh_interval_secs: 300,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 100,
            lock_ttl_secs: 120,
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            supported_currencies: vec!["BTC".into(), "ETH".into()],
            required_confirmations: HashMap::from([("BTC".into(), 3), ("ETH".into(), 12)]),
            pending_expiry_minutes: DEFAULT_PENDING_MINUTES,
            confirming_timeout_minutes: DEFAULT_CONFIRMING_MINUTES,
            webhooks: WebhookConfig::default(),
            rates: RateConfig::default(),
            reconciler: ReconcilerConfig::default(),
            bitcoin: None,
            ethereum: None,
        }
    }
}

impl PaymentsConfig {
    pub fn is_supported(&self, currency: &str) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }

    /// Confirmation depth for `currency`; unknown symbols fall back to 2.
    pub fn required_confirmations_for(&self, currency: &str) -> u32 {
        self.required_confirmations
            .get(&currency.to_ascii_uppercase())
            .copied()
            .unwrap_or(DEFAULT_REQUIRED_CONFIRMATIONS)
    }

    /// Load overrides from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(list) = env_list("CRYPTOPAY_SUPPORTED_CURRENCIES") {
            config.supported_currencies = list.into_iter().map(|c| c.to_uppercase()).collect();
        }
        if let Some(n) = env_parse("BTC_CONFIRMATIONS") {
            config.required_confirmations.insert("BTC".into(), n);
        }
        if let Some(n) = env_parse("ETH_CONFIRMATIONS") {
            config.required_confirmations.insert("ETH".into(), n);
        }
        config.pending_expiry_minutes =
            env_parse("PAYMENT_PENDING_MINUTES").unwrap_or(DEFAULT_PENDING_MINUTES);
        config.confirming_timeout_minutes =
            env_parse("PAYMENT_CONFIRMING_MINUTES").unwrap_or(DEFAULT_CONFIRMING_MINUTES);

        let webhooks = &mut config.webhooks;
        webhooks.enabled = env::var("WEBHOOKS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        webhooks.timeout_secs = env_parse("WEBHOOK_TIMEOUT_SECS").unwrap_or(webhooks.timeout_secs);
        webhooks.max_attempts = env_parse("WEBHOOK_MAX_ATTEMPTS").unwrap_or(webhooks.max_attempts);
        webhooks.retry_delay_secs =
            env_parse("WEBHOOK_RETRY_DELAY_SECS").unwrap_or(webhooks.retry_delay_secs);
        webhooks.failure_threshold =
            env_parse("WEBHOOK_FAILURE_THRESHOLD").unwrap_or(webhooks.failure_threshold);
        webhooks.workers = env_parse("WEBHOOK_WORKERS").unwrap_or(webhooks.workers);

        let rates = &mut config.rates;
        rates.ttl_secs = env_parse("EXCHANGE_RATE_TTL_SECS").unwrap_or(rates.ttl_secs);
        if let Ok(url) = env::var("EXCHANGE_RATE_API_URL") {
            rates.api_url = url;
        }
        if let Some(list) = env_list("TRACKED_FIAT") {
            rates.tracked_fiat = list.into_iter().map(|c| c.to_uppercase()).collect();
        }
        rates.refresh_interval_secs =
            env_parse("EXCHANGE_RATE_REFRESH_SECS").unwrap_or(rates.refresh_interval_secs);

        let reconciler = &mut config.reconciler;
        reconciler.interval_secs =
            env_parse("RECONCILE_INTERVAL_SECS").unwrap_or(reconciler.interval_secs);
        reconciler.batch_size = env_parse("RECONCILE_BATCH_SIZE").unwrap_or(reconciler.batch_size);
        reconciler.lock_ttl_secs =
            env_parse("RECONCILE_LOCK_TTL_SECS").unwrap_or(reconciler.lock_ttl_secs);

        let rpc_timeout: u64 = env_parse("RPC_TIMEOUT_SECS").unwrap_or(30);

        config.bitcoin = env::var("BTC_RPC_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|rpc_url| BitcoinRpcConfig {
                rpc_url,
                rpc_user: env::var("BTC_RPC_USER").unwrap_or_default(),
                rpc_password: env::var("BTC_RPC_PASSWORD").unwrap_or_default(),
                timeout_secs: rpc_timeout,
            });
        config.ethereum = env::var("ETH_RPC_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|rpc_url| EthereumRpcConfig {
                rpc_url,
                timeout_secs: rpc_timeout,
                scan_blocks: env_parse("ETH_SCAN_BLOCKS").unwrap_or(64),
            });

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.rates.api_url)
            .map_err(|_| ConfigError::InvalidUrl(self.rates.api_url.clone()))?;
        if let Some(btc) = &self.bitcoin {
            Url::parse(&btc.rpc_url).map_err(|_| ConfigError::InvalidUrl(btc.rpc_url.clone()))?;
        }
        if let Some(eth) = &self.ethereum {
            Url::parse(&eth.rpc_url).map_err(|_| ConfigError::InvalidUrl(eth.rpc_url.clone()))?;
        }
        if self.supported_currencies.is_empty() {
            return Err(ConfigError::InvalidValue(
                "supported currency list is empty".into(),
            ));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.webhooks.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.reconciler.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_BATCH_SIZE must be at least 1".into(),
            ));
        }
        if self.required_confirmations.values().any(|n| *n == 0) {
            return Err(ConfigError::InvalidValue(
                "required confirmations must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
