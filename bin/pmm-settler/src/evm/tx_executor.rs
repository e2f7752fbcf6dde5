//! EVM transaction submission: gas-limit estimation, EIP-1559/legacy fee
//! resolution with hard caps, and nonce-error recovery.
//!
//! Fee policy: the provider's own `maxFeePerGas` estimate is never trusted
//! directly (public RPCs routinely return wildly inflated values). The
//! computed price is `2 × baseFee + priority`, capped at `3 × baseFee` and at
//! any caller-supplied maximum, and the priority fee never exceeds the final
//! max fee.

use std::sync::Arc;

use alloy::network::TransactionBuilder;
use alloy::primitives::{B256, U256};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::TransactionRequest;
use settler_models::GasReceipt;
use snafu::Snafu;
use tracing::{debug, info, warn};

use super::NonceManager;

const GAS_LIMIT_BUFFER_NUM: u64 = 12;
const GAS_LIMIT_BUFFER_DEN: u64 = 10;
const FALLBACK_GAS_LIMIT: u64 = 500_000;
/// Bounded retries after a nonce resync.
const MAX_NONCE_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorCategory {
    GasLimit,
    GasPrice,
    Nonce,
    Other,
}

#[derive(Debug, Snafu)]
pub enum ExecutorError {
    #[snafu(display("Nonce management failed: {source}"))]
    Nonce { source: super::nonce_manager::NonceError },

    #[snafu(display("Failed to read fee data for network {network_id}: {reason}"))]
    FeeData { network_id: String, reason: String },

    #[snafu(display("Transaction submission failed ({category:?}): {reason}"))]
    Submission {
        category: TxErrorCategory,
        reason: String,
    },
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Caller-supplied gas knobs; all optional.
#[derive(Debug, Clone, Default)]
pub struct GasOverrides {
    pub gas_limit: Option<u64>,
    /// Explicit legacy gas price.
    pub gas_price: Option<U256>,
    /// Explicit EIP-1559 pair; takes precedence over everything else.
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    /// Hard ceiling on whatever price ends up being used.
    pub max_gas_price: Option<U256>,
}

#[derive(Debug, Clone)]
pub struct ExecutedTx {
    pub hash: B256,
    pub gas: GasReceipt,
}

pub struct TransactionExecutor {
    provider: DynProvider,
    nonce_manager: Arc<NonceManager>,
    network_id: String,
}

impl TransactionExecutor {
    pub fn new(provider: DynProvider, nonce_manager: Arc<NonceManager>, network_id: &str) -> Self {
        Self {
            provider,
            nonce_manager,
            network_id: network_id.to_string(),
        }
    }

    pub async fn execute(
        &self,
        mut tx: TransactionRequest,
        overrides: &GasOverrides,
    ) -> Result<ExecutedTx> {
        let gas_limit = self.resolve_gas_limit(&tx, overrides).await;
        tx.set_gas_limit(gas_limit);

        let fees = self.resolve_fees(overrides).await?;
        let mut receipt = GasReceipt {
            gas_limit: Some(gas_limit),
            ..Default::default()
        };
        match fees {
            ResolvedFees::Legacy { gas_price } => {
                tx.set_gas_price(gas_price.to::<u128>());
                receipt.gas_price = Some(gas_price);
            }
            ResolvedFees::Eip1559 { max_fee, priority } => {
                tx.set_max_fee_per_gas(max_fee.to::<u128>());
                tx.set_max_priority_fee_per_gas(priority.to::<u128>());
                receipt.max_fee_per_gas = Some(max_fee);
                receipt.max_priority_fee_per_gas = Some(priority);
            }
        }

        let mut nonce_retries = 0u32;
        loop {
            let nonce = self
                .nonce_manager
                .reserve_nonce(&self.network_id)
                .await
                .map_err(|source| ExecutorError::Nonce { source })?;
            tx.set_nonce(nonce);
            receipt.nonce = Some(nonce);

            match self.provider.send_transaction(tx.clone()).await {
                Ok(pending) => {
                    let hash = *pending.tx_hash();
                    info!(
                        network_id = self.network_id,
                        %hash,
                        nonce,
                        gas_limit,
                        "transaction submitted"
                    );
                    return Ok(ExecutedTx {
                        hash,
                        gas: receipt,
                    });
                }
                Err(e) => {
                    let reason = e.to_string();
                    let category = classify_error(&reason);
                    if category == TxErrorCategory::Nonce && nonce_retries < MAX_NONCE_RETRIES {
                        nonce_retries += 1;
                        warn!(
                            network_id = self.network_id,
                            nonce,
                            reason,
                            "nonce-class submission error, resyncing and retrying"
                        );
                        self.nonce_manager
                            .force_refresh(&self.network_id)
                            .await
                            .map_err(|source| ExecutorError::Nonce { source })?;
                        continue;
                    }
                    return Err(ExecutorError::Submission { category, reason });
                }
            }
        }
    }

    async fn resolve_gas_limit(&self, tx: &TransactionRequest, overrides: &GasOverrides) -> u64 {
        if let Some(explicit) = overrides.gas_limit {
            return explicit;
        }
        match self.provider.estimate_gas(tx.clone()).await {
            Ok(estimated) => estimated * GAS_LIMIT_BUFFER_NUM / GAS_LIMIT_BUFFER_DEN,
            Err(e) => {
                warn!(
                    network_id = self.network_id,
                    error = %e,
                    fallback = FALLBACK_GAS_LIMIT,
                    "gas estimation failed, using fallback limit"
                );
                FALLBACK_GAS_LIMIT
            }
        }
    }

    async fn resolve_fees(&self, overrides: &GasOverrides) -> Result<ResolvedFees> {
        if let Some(max_fee) = overrides.max_fee_per_gas {
            let priority = overrides
                .max_priority_fee_per_gas
                .unwrap_or(U256::ZERO)
                .min(max_fee);
            return Ok(ResolvedFees::Eip1559 { max_fee, priority });
        }
        if let Some(gas_price) = overrides.gas_price {
            let capped = match overrides.max_gas_price {
                Some(cap) => gas_price.min(cap),
                None => gas_price,
            };
            return Ok(ResolvedFees::Legacy { gas_price: capped });
        }

        let base_fee = self.fetch_base_fee().await?;
        let provider_priority = self
            .provider
            .get_max_priority_fee_per_gas()
            .await
            .map(U256::from)
            .unwrap_or_else(|e| {
                debug!(error = %e, "priority fee estimate unavailable, defaulting to zero");
                U256::ZERO
            });

        Ok(compute_eip1559_fees(
            base_fee,
            provider_priority,
            overrides.max_gas_price,
        ))
    }

    async fn fetch_base_fee(&self) -> Result<U256> {
        let block = self
            .provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await
            .map_err(|e| ExecutorError::FeeData {
                network_id: self.network_id.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| ExecutorError::FeeData {
                network_id: self.network_id.clone(),
                reason: "no latest block".to_string(),
            })?;
        block
            .header
            .base_fee_per_gas
            .map(U256::from)
            .ok_or_else(|| ExecutorError::FeeData {
                network_id: self.network_id.clone(),
                reason: "latest block carries no base fee".to_string(),
            })
    }
}

enum ResolvedFees {
    Legacy { gas_price: U256 },
    Eip1559 { max_fee: U256, priority: U256 },
}

/// `2 × base + priority`, capped at `3 × base` and the caller max; the
/// priority fee is clamped to the final max fee.
fn compute_eip1559_fees(
    base_fee: U256,
    provider_priority: U256,
    caller_max: Option<U256>,
) -> ResolvedFees {
    let mut max_fee = base_fee * U256::from(2u8) + provider_priority;

    let hard_cap = base_fee * U256::from(3u8);
    if max_fee > hard_cap {
        max_fee = hard_cap;
    }
    if let Some(cap) = caller_max {
        if max_fee > cap {
            max_fee = cap;
        }
    }

    let priority = provider_priority.min(max_fee);
    ResolvedFees::Eip1559 { max_fee, priority }
}

/// Sort a submission failure into the bucket the retry policy cares about.
pub fn classify_error(reason: &str) -> TxErrorCategory {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
    {
        TxErrorCategory::Nonce
    } else if lower.contains("gas required exceeds")
        || lower.contains("intrinsic gas too low")
        || lower.contains("out of gas")
        || lower.contains("gas limit")
    {
        TxErrorCategory::GasLimit
    } else if lower.contains("underpriced")
        || lower.contains("fee cap")
        || lower.contains("max fee per gas")
        || lower.contains("tip higher than fee cap")
    {
        TxErrorCategory::GasPrice
    } else {
        TxErrorCategory::Other
    }
}
