//! Exchange rates: provider interface, CoinGecko client and the TTL cache
//! that payment creation reads through.
//!
//! Lookup order in [`ExchangeRateCache::get_rate`]:
//! 1. in-process cache entry younger than the TTL
//! 2. persisted row whose `updated_at` is within the TTL
//! 3. fresh provider fetch, upserted and cached
//!
//! There is no stale fallback: if all three miss, the caller gets
//! [`PaymentError::RateUnavailable`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::RateConfig;
use crate::error::{PaymentError, Result};
use crate::metrics;
use crate::store::RateRepository;
use crate::types::{utc_now, ExchangeRate};

/// A rate as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RateQuote {
    pub rate: Decimal,
    pub volume_24h: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub change_24h: Option<Decimal>,
}

impl RateQuote {
    pub fn new(rate: Decimal) -> Self {
        Self {
            rate,
            volume_24h: None,
            market_cap: None,
            change_24h: None,
        }
    }
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Recorded as `source` on persisted rates.
    fn name(&self) -> &str;

    /// Fiat price of one unit of `crypto`.
    async fn fetch_rate(&self, crypto: &str, fiat: &str) -> Result<RateQuote>;
}

/// CoinGecko `/simple/price` client.
pub struct CoinGeckoProvider {
    http: reqwest::Client,
    api_url: String,
}

impl CoinGeckoProvider {
    pub fn new(config: &RateConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PaymentError::Internal(format!("failed to build rate client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// CoinGecko coin id for a ticker symbol.
    pub fn coin_id(symbol: &str) -> Option<&'static str> {
        match symbol.to_ascii_uppercase().as_str() {
            "BTC" => Some("bitcoin"),
            "ETH" => Some("ethereum"),
            "USDC" => Some("usd-coin"),
            "USDT" => Some("tether"),
            _ => None,
        }
    }
}

fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let n = value.as_number()?;
    Decimal::from_str(&n.to_string())
        .ok()
        .or_else(|| n.as_f64().and_then(Decimal::from_f64))
}

#[async_trait]
impl RateProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn fetch_rate(&self, crypto: &str, fiat: &str) -> Result<RateQuote> {
        let coin = Self::coin_id(crypto)
            .ok_or_else(|| PaymentError::UnsupportedCurrency(crypto.to_string()))?;
        let vs = fiat.to_ascii_lowercase();

        let resp = self
            .http
            .get(format!("{}/simple/price", self.api_url))
            .query(&[
                ("ids", coin),
                ("vs_currencies", vs.as_str()),
                ("include_24hr_vol", "true"),
                ("include_market_cap", "true"),
                ("include_24hr_change", "true"),
            ])
            .send()
            .await
            .map_err(|e| PaymentError::RateUnavailable(format!("{crypto}/{fiat}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PaymentError::RateUnavailable(format!(
                "{crypto}/{fiat}: provider returned {status}"
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| PaymentError::RateUnavailable(format!("{crypto}/{fiat}: {e}")))?;

        let entry = &body[coin];
        let rate = decimal_from_json(&entry[vs.as_str()])
            .filter(|r| *r > Decimal::ZERO)
            .ok_or_else(|| {
                PaymentError::RateUnavailable(format!("{crypto}/{fiat}: no price in response"))
            })?;

        Ok(RateQuote {
            rate,
            volume_24h: decimal_from_json(&entry[format!("{vs}_24h_vol")]),
            market_cap: decimal_from_json(&entry[format!("{vs}_market_cap")]),
            change_24h: decimal_from_json(&entry[format!("{vs}_24h_change")]),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: Decimal,
    cached_at: Instant,
}

/// Read-through rate cache backed by the persisted last-known rates.
pub struct ExchangeRateCache {
    store: Arc<dyn RateRepository>,
    provider: Arc<dyn RateProvider>,
    ttl: Duration,
    entries: DashMap<(String, String), CachedRate>,
}

impl ExchangeRateCache {
    pub fn new(
        store: Arc<dyn RateRepository>,
        provider: Arc<dyn RateProvider>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            ttl,
            entries: DashMap::new(),
        }
    }

    fn key(crypto: &str, fiat: &str) -> (String, String) {
        (crypto.to_ascii_uppercase(), fiat.to_ascii_uppercase())
    }

    /// Fiat price of one unit of `crypto`.
    pub async fn get_rate(&self, crypto: &str, fiat: &str) -> Result<Decimal> {
        let key = Self::key(crypto, fiat);

        if let Some(hit) = self.entries.get(&key) {
            if hit.cached_at.elapsed() < self.ttl {
                metrics::RATE_LOOKUPS.with_label_values(&["cache"]).inc();
                return Ok(hit.rate);
            }
        }

        match self.store.latest_rate(&key.0, &key.1) {
            Ok(Some(row)) if self.within_ttl(&row) => {
                metrics::RATE_LOOKUPS.with_label_values(&["store"]).inc();
                self.remember(key, row.rate);
                return Ok(row.rate);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(crypto = %key.0, fiat = %key.1, error = %e, "failed to read stored rate");
            }
        }

        self.fetch_and_store(key).await
    }

    /// Bypass both cache layers and pull a fresh rate from the provider.
    pub async fn refresh_rate(&self, crypto: &str, fiat: &str) -> Result<Decimal> {
        self.fetch_and_store(Self::key(crypto, fiat)).await
    }

    /// Refresh every `currencies` × `fiats` pair. Failures are logged per pair
    /// and never stop the sweep. Returns how many pairs were refreshed.
    pub async fn refresh_all_rates(&self, currencies: &[String], fiats: &[String]) -> usize {
        let mut refreshed = 0;
        for crypto in currencies {
            for fiat in fiats {
                match self.refresh_rate(crypto, fiat).await {
                    Ok(_) => refreshed += 1,
                    Err(e) => {
                        tracing::warn!(crypto = %crypto, fiat = %fiat, error = %e, "rate refresh failed");
                    }
                }
            }
        }
        tracing::debug!(refreshed, "exchange rates refreshed");
        refreshed
    }

    pub async fn convert_to_fiat(
        &self,
        amount_crypto: Decimal,
        crypto: &str,
        fiat: &str,
    ) -> Result<Decimal> {
        let rate = self.get_rate(crypto, fiat).await?;
        Ok((amount_crypto * rate).round_dp(2))
    }

    pub async fn convert_to_crypto(
        &self,
        amount_fiat: Decimal,
        fiat: &str,
        crypto: &str,
    ) -> Result<Decimal> {
        let rate = self.get_rate(crypto, fiat).await?;
        amount_fiat
            .checked_div(rate)
            .map(|amount| amount.round_dp(8))
            .ok_or_else(|| PaymentError::RateUnavailable(format!("{crypto}/{fiat}: zero rate")))
    }

    /// Start a background task refreshing all pairs every `interval`.
    pub fn start_refresher(
        self: &Arc<Self>,
        currencies: Vec<String>,
        fiats: Vec<String>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.refresh_all_rates(&currencies, &fiats).await;
            }
        })
    }

    fn within_ttl(&self, row: &ExchangeRate) -> bool {
        (utc_now() - row.updated_at)
            .to_std()
            .map(|age| age < self.ttl)
            .unwrap_or(true)
    }

    fn remember(&self, key: (String, String), rate: Decimal) {
        self.entries.insert(
            key,
            CachedRate {
                rate,
                cached_at: Instant::now(),
            },
        );
    }

    async fn fetch_and_store(&self, key: (String, String)) -> Result<Decimal> {
        let (crypto, fiat) = (&key.0, &key.1);
        let quote = match self.provider.fetch_rate(crypto, fiat).await {
            Ok(quote) => quote,
            Err(e) => {
                metrics::RATE_LOOKUPS.with_label_values(&["error"]).inc();
                return Err(match e {
                    PaymentError::UnsupportedCurrency(_) | PaymentError::RateUnavailable(_) => e,
                    other => PaymentError::RateUnavailable(format!("{crypto}/{fiat}: {other}")),
                });
            }
        };
        if quote.rate <= Decimal::ZERO {
            metrics::RATE_LOOKUPS.with_label_values(&["error"]).inc();
            return Err(PaymentError::RateUnavailable(format!(
                "{crypto}/{fiat}: non-positive rate {}",
                quote.rate
            )));
        }
        metrics::RATE_LOOKUPS.with_label_values(&["provider"]).inc();

        let row = ExchangeRate {
            crypto_currency: crypto.clone(),
            fiat_currency: fiat.clone(),
            rate: quote.rate,
            source: self.provider.name().to_string(),
            volume_24h: quote.volume_24h,
            market_cap: quote.market_cap,
            change_24h: quote.change_24h,
            updated_at: utc_now(),
        };
        if let Err(e) = self.store.upsert_rate(&row) {
            tracing::warn!(crypto = %crypto, fiat = %fiat, error = %e, "failed to persist rate");
        }

        let rate = quote.rate;
        self.remember(key, rate);
        Ok(rate)
    }
}
