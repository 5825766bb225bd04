//! Bitcoin Core JSON-RPC client.
//!
//! Receiving addresses come from the node wallet (`getnewaddress`, bech32), so
//! incoming transfers are correlated by scanning the wallet's unspent outputs
//! for the payment address.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ChainClient;
use crate::config::BitcoinRpcConfig;
use crate::error::{PaymentError, Result};
use crate::types::Payment;

/// RPC_INVALID_ADDRESS_OR_KEY: returned by `getrawtransaction` for unknown txids.
const RPC_NOT_FOUND: i64 = -5;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Unspent {
    txid: String,
    amount: f64,
}

pub struct BitcoinClient {
    http: reqwest::Client,
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
}

impl BitcoinClient {
    pub fn new(config: &BitcoinRpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::Internal(format!("failed to build RPC client: {e}")))?;
        Ok(Self {
            http,
            rpc_url: config.rpc_url.clone(),
            rpc_user: config.rpc_user.clone(),
            rpc_password: config.rpc_password.clone(),
        })
    }

    /// Issue one JSON-RPC call. RPC-level errors come back as `Err((code, message))`
    /// inside the outer `Ok` so callers can special-case codes.
    async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<std::result::Result<Value, (i64, String)>> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "cryptopay",
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .basic_auth(&self.rpc_user, Some(&self.rpc_password))
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::ChainCommunication(format!("{method}: {e}")))?;

        // Bitcoin Core answers RPC errors with HTTP 500 and a JSON body.
        let status = resp.status();
        let parsed: RpcResponse = resp.json().await.map_err(|e| {
            PaymentError::ChainCommunication(format!("{method}: bad response ({status}): {e}"))
        })?;

        match (parsed.error, parsed.result) {
            (Some(err), _) => Ok(Err((err.code, err.message))),
            (None, Some(result)) => Ok(Ok(result)),
            (None, None) => Ok(Ok(Value::Null)),
        }
    }

    async fn call_ok(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params).await?.map_err(|(code, message)| {
            PaymentError::ChainCommunication(format!("{method} failed ({code}): {message}"))
        })
    }
}

#[async_trait]
impl ChainClient for BitcoinClient {
    fn currency(&self) -> &str {
        "BTC"
    }

    async fn generate_address(&self) -> Result<String> {
        let result = self.call_ok("getnewaddress", json!(["", "bech32"])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PaymentError::ChainCommunication("getnewaddress: no address".into()))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let result = self.call_ok("validateaddress", json!([address])).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn get_confirmations(&self, tx_hash: &str) -> Result<u32> {
        match self
            .call("getrawtransaction", json!([tx_hash, true]))
            .await?
        {
            Ok(tx) => Ok(tx
                .get("confirmations")
                .and_then(Value::as_i64)
                .map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX))
                .unwrap_or(0)),
            Err((RPC_NOT_FOUND, _)) => Ok(0),
            Err((code, message)) => Err(PaymentError::ChainCommunication(format!(
                "getrawtransaction failed ({code}): {message}"
            ))),
        }
    }

    async fn find_incoming_transaction(&self, payment: &Payment) -> Result<Option<String>> {
        let result = self
            .call_ok(
                "listunspent",
                json!([0, 9_999_999, [payment.wallet_address]]),
            )
            .await?;
        let outputs: Vec<Unspent> = serde_json::from_value(result)?;

        let found = outputs.into_iter().find(|utxo| {
            Decimal::from_f64(utxo.amount)
                .map(|amount| amount.round_dp(8) >= payment.amount_crypto)
                .unwrap_or(false)
        });

        if let Some(ref utxo) = found {
            tracing::debug!(
                payment_id = %payment.id,
                txid = %utxo.txid,
                "matched incoming bitcoin output"
            );
        }
        Ok(found.map(|u| u.txid))
    }
}
