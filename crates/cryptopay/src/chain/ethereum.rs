//! Ethereum client over any alloy provider.
//!
//! Addresses are created in the node keystore (`personal_newAccount`).
//! Incoming native transfers are found by scanning recent blocks for a
//! transaction to the payment address carrying at least the expected value.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionResponse as _;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::ChainClient;
use crate::error::{PaymentError, Result};
use crate::types::Payment;

/// Blocks inspected per correlation attempt.
const DEFAULT_SCAN_DEPTH: u64 = 64;

pub struct EthereumClient<P> {
    provider: P,
    timeout: Duration,
    scan_depth: u64,
}

impl<P: Provider> EthereumClient<P> {
    pub fn new(provider: P, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            scan_depth: DEFAULT_SCAN_DEPTH,
        }
    }

    pub fn with_scan_depth(mut self, blocks: u64) -> Self {
        self.scan_depth = blocks.max(1);
        self
    }

    /// Run an RPC future under the client timeout.
    async fn bounded<T, E, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: IntoFuture<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.timeout, call.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PaymentError::ChainCommunication(format!("{what}: {e}"))),
            Err(_) => Err(PaymentError::ChainCommunication(format!(
                "{what}: timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Convert an ETH amount to wei, truncating below 1 wei.
fn to_wei(amount: Decimal) -> Option<U256> {
    let wei = amount
        .checked_mul(Decimal::from(1_000_000_000_000_000_000u64))?
        .trunc();
    wei.to_u128().map(U256::from)
}

pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42 && address.starts_with("0x") && address.parse::<Address>().is_ok()
}

#[async_trait]
impl<P: Provider + Send + Sync> ChainClient for EthereumClient<P> {
    fn currency(&self) -> &str {
        "ETH"
    }

    async fn generate_address(&self) -> Result<String> {
        let address: Address = self
            .bounded(
                "personal_newAccount",
                self.provider
                    .raw_request("personal_newAccount".into(), ("",)),
            )
            .await?;
        Ok(address.to_checksum(None))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        Ok(is_valid_address(address))
    }

    async fn get_confirmations(&self, tx_hash: &str) -> Result<u32> {
        let hash: B256 = tx_hash
            .parse()
            .map_err(|_| PaymentError::ChainCommunication(format!("invalid tx hash {tx_hash}")))?;

        let receipt = self
            .bounded(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(hash),
            )
            .await?;
        let Some(mined_at) = receipt.and_then(|r| r.block_number) else {
            return Ok(0);
        };

        let latest = self
            .bounded("eth_blockNumber", self.provider.get_block_number())
            .await?;
        // The inclusion block itself counts as the first confirmation.
        let depth = latest.saturating_sub(mined_at).saturating_add(1);
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }

    async fn find_incoming_transaction(&self, payment: &Payment) -> Result<Option<String>> {
        let target: Address = payment
            .wallet_address
            .parse()
            .map_err(|_| PaymentError::InvalidAddress(payment.wallet_address.clone()))?;
        let Some(expected) = to_wei(payment.amount_crypto) else {
            return Err(PaymentError::Internal(format!(
                "amount {} does not fit in wei",
                payment.amount_crypto
            )));
        };
        let created_at = u64::try_from(payment.created_at.timestamp()).unwrap_or(0);

        let latest = self
            .bounded("eth_blockNumber", self.provider.get_block_number())
            .await?;
        let oldest = latest.saturating_sub(self.scan_depth - 1);

        for number in (oldest..=latest).rev() {
            let block = self
                .bounded(
                    "eth_getBlockByNumber",
                    self.provider
                        .get_block_by_number(BlockNumberOrTag::Number(number))
                        .full(),
                )
                .await?;
            let Some(block) = block else {
                continue;
            };
            if block.header.timestamp < created_at {
                break;
            }
            let hit = block
                .transactions
                .into_transactions()
                .find(|tx| tx.to() == Some(target) && tx.value() >= expected);
            if let Some(tx) = hit {
                let hash = format!("{:#x}", tx.tx_hash());
                tracing::debug!(
                    payment_id = %payment.id,
                    tx = %hash,
                    block = number,
                    "matched incoming ethereum transfer"
                );
                return Ok(Some(hash));
            }
        }
        Ok(None)
    }
}
