//! Liquidation settlements through the multisig liquidation vault.
//!
//! The vault's `payment` only executes with signatures from a quorum of
//! approver keys, collected off-chain over the payment digest. A contract
//! revert here does not fail the job: the selector is surfaced as
//! `TransferOutcome::Reverted` so downstream reporting still gets a
//! hash-shaped id while reconciliation happens manually.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use chrono::Utc;
use settler_models::{TransferOutcome, TransferParams};
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::signing::hex_to_b256;
use crate::strategies::evm::EvmNetworkCtx;
use crate::strategies::{extract_revert_selector, Result, TransferError, TransferStrategy};

const PAYMENT_DEADLINE_SECS: i64 = 30 * 60;
const MIN_APPROVERS: usize = 2;

sol! {
    #[sol(rpc)]
    interface IERC20Balance {
        function balanceOf(address owner) external view returns (uint256);
    }

    #[sol(rpc)]
    interface ILiquidationVault {
        function payment(
            bytes32 tradeId,
            address token,
            address to,
            uint256 amount,
            uint256 deadline,
            bytes[] signatures
        ) external;
    }
}

/// Per-network liquidation deployment: the vault contract and its approver
/// quorum keys.
pub struct LiquidationVaultConfig {
    pub vault: Address,
    pub approvers: Vec<PrivateKeySigner>,
}

pub struct LiquidationTransferStrategy {
    networks: HashMap<String, Arc<EvmNetworkCtx>>,
    vaults: HashMap<String, LiquidationVaultConfig>,
    notifier: Arc<dyn Notifier>,
}

impl LiquidationTransferStrategy {
    pub fn new(
        networks: HashMap<String, Arc<EvmNetworkCtx>>,
        vaults: HashMap<String, LiquidationVaultConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        for (network_id, config) in &vaults {
            if config.approvers.len() < MIN_APPROVERS {
                return Err(TransferError::Misconfigured {
                    reason: format!(
                        "liquidation vault on network {network_id} requires at least {MIN_APPROVERS} approver keys, got {}",
                        config.approvers.len()
                    ),
                });
            }
        }
        Ok(Self {
            networks,
            vaults,
            notifier,
        })
    }

    fn deployment(&self, network_id: &str) -> Result<(&Arc<EvmNetworkCtx>, &LiquidationVaultConfig)> {
        let ctx = self
            .networks
            .get(network_id)
            .ok_or_else(|| TransferError::Misconfigured {
                reason: format!("no EVM network configured for id {network_id}"),
            })?;
        let vault = self
            .vaults
            .get(network_id)
            .ok_or_else(|| TransferError::Misconfigured {
                reason: format!("no liquidation vault configured for network {network_id}"),
            })?;
        Ok((ctx, vault))
    }

    /// Approver signatures over `keccak256(abi.encode(tradeId, token, to,
    /// amount, deadline))`, in registration order. The vault checks the same
    /// digest.
    fn collect_approvals(
        &self,
        approvers: &[PrivateKeySigner],
        trade_id: B256,
        token: Address,
        to: Address,
        amount: U256,
        deadline: U256,
    ) -> Result<Vec<Bytes>> {
        let digest = keccak256((trade_id, token, to, amount, deadline).abi_encode());
        approvers
            .iter()
            .map(|approver| {
                approver
                    .sign_hash_sync(&digest)
                    .map(|sig| Bytes::from(sig.as_bytes().to_vec()))
                    .map_err(|e| TransferError::Misconfigured {
                        reason: format!("approver signature failed: {e}"),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl TransferStrategy for LiquidationTransferStrategy {
    async fn transfer(&self, params: &TransferParams) -> Result<TransferOutcome> {
        let network_id = params.token.network_id.clone();
        let (ctx, deployment) = self.deployment(&network_id)?;
        let ctx = ctx.clone();

        let to: Address =
            params
                .to_address
                .parse()
                .map_err(|_| TransferError::InvalidAddress {
                    address: params.to_address.clone(),
                    reason: "not an EVM address".to_string(),
                })?;
        let token: Address =
            params
                .token
                .address
                .parse()
                .map_err(|_| TransferError::InvalidAddress {
                    address: params.token.address.clone(),
                    reason: "not an EVM token address".to_string(),
                })?;

        // The vault pays from its own balance.
        let erc20 = IERC20Balance::new(token, &ctx.provider);
        let vault_balance =
            erc20
                .balanceOf(deployment.vault)
                .call()
                .await
                .map_err(|e| TransferError::BroadcastFailed {
                    reason: format!("vault balance read failed: {e}"),
                })?;
        if vault_balance < params.amount {
            self.notifier
                .send_message(&format!(
                    "Liquidation vault on network {network_id} cannot cover {} {}: vault holds {vault_balance}. Manual top-up required.",
                    params.amount, params.token.symbol
                ))
                .await;
            return Err(TransferError::InsufficientBalance {
                token: params.token.symbol.clone(),
                required: params.amount.to_string(),
                available: vault_balance.to_string(),
            });
        }

        let trade_id =
            hex_to_b256(&params.trade_id).map_err(|e| TransferError::InvalidAddress {
                address: params.trade_id.clone(),
                reason: e.to_string(),
            })?;
        let deadline = U256::from((Utc::now().timestamp() + PAYMENT_DEADLINE_SECS) as u64);

        let signatures = self.collect_approvals(
            &deployment.approvers,
            trade_id,
            token,
            to,
            params.amount,
            deadline,
        )?;

        let vault = ILiquidationVault::new(deployment.vault, &ctx.provider);
        let tx = vault
            .payment(trade_id, token, to, params.amount, deadline, signatures)
            .into_transaction_request();

        info!(
            trade_id = params.trade_id,
            network_id,
            vault = %deployment.vault,
            amount = %params.amount,
            "executing liquidation payment"
        );

        match ctx.executor.execute(tx, &ctx.gas_overrides).await {
            Ok(executed) => Ok(TransferOutcome::Submitted {
                hash: format!("{:#x}", executed.hash),
                gas: executed.gas,
            }),
            Err(e) => {
                let reason = e.to_string();
                match extract_revert_selector(&reason) {
                    Some(selector) => {
                        warn!(
                            trade_id = params.trade_id,
                            selector,
                            "liquidation vault reverted; reporting selector for manual reconciliation"
                        );
                        self.notifier
                            .send_message(&format!(
                                "Liquidation payment for trade {} reverted with selector {selector}; needs manual reconciliation.",
                                params.trade_id
                            ))
                            .await;
                        Ok(TransferOutcome::Reverted { selector })
                    }
                    None => Err(TransferError::Execution { source: e }),
                }
            }
        }
    }
}
