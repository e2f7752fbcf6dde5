//! EVM settlement transfers through the protocol payment contract.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::sol;
use async_trait::async_trait;
use chrono::Utc;
use router_client::{AssetChainRole, RouterClient};
use settler_models::{TransferOutcome, TransferParams};
use tracing::{info, warn};

use crate::evm::{GasOverrides, TransactionExecutor};
use crate::notify::Notifier;
use crate::signing::hex_to_b256;
use crate::strategies::{decode_revert_reason, Result, TransferError, TransferStrategy};

/// Settlement payment deadline: the contract rejects the call after this.
const PAYMENT_DEADLINE_SECS: i64 = 30 * 60;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
    }

    #[sol(rpc)]
    interface IPaymentRouter {
        function payment(
            bytes32 tradeId,
            address token,
            address to,
            uint256 amount,
            uint256 protocolFee,
            uint256 deadline
        ) external payable;
    }
}

/// Per-network execution context shared by the EVM strategies.
pub struct EvmNetworkCtx {
    pub provider: DynProvider,
    pub executor: Arc<TransactionExecutor>,
    pub gas_overrides: GasOverrides,
}

pub struct EvmTransferStrategy {
    networks: HashMap<String, Arc<EvmNetworkCtx>>,
    router: Arc<RouterClient>,
    notifier: Arc<dyn Notifier>,
    sender: Address,
}

impl EvmTransferStrategy {
    pub fn new(
        networks: HashMap<String, Arc<EvmNetworkCtx>>,
        router: Arc<RouterClient>,
        notifier: Arc<dyn Notifier>,
        sender: Address,
    ) -> Self {
        Self {
            networks,
            router,
            notifier,
            sender,
        }
    }

    fn network(&self, network_id: &str) -> Result<&Arc<EvmNetworkCtx>> {
        self.networks
            .get(network_id)
            .ok_or_else(|| TransferError::Misconfigured {
                reason: format!("no EVM network configured for id {network_id}"),
            })
    }

    async fn ensure_balance(
        &self,
        ctx: &EvmNetworkCtx,
        network_id: &str,
        token: Address,
        required: U256,
        symbol: &str,
    ) -> Result<()> {
        let erc20 = IERC20::new(token, &ctx.provider);
        let available =
            erc20
                .balanceOf(self.sender)
                .call()
                .await
                .map_err(|e| TransferError::BroadcastFailed {
                    reason: format!("balance read failed: {e}"),
                })?;

        if available < required {
            self.notifier
                .send_message(&format!(
                    "Insufficient {symbol} balance on network {network_id}: need {required}, have {available}. Manual top-up required."
                ))
                .await;
            return Err(TransferError::InsufficientBalance {
                token: symbol.to_string(),
                required: required.to_string(),
                available: available.to_string(),
            });
        }
        Ok(())
    }

    /// USDT-style tokens revert on approve(non-zero) while an allowance is
    /// outstanding, so a stale allowance is reset to zero before approving
    /// max.
    async fn ensure_allowance(
        &self,
        ctx: &EvmNetworkCtx,
        network_id: &str,
        token: Address,
        spender: Address,
        required: U256,
    ) -> Result<()> {
        let erc20 = IERC20::new(token, &ctx.provider);
        let current = erc20
            .allowance(self.sender, spender)
            .call()
            .await
            .map_err(|e| TransferError::BroadcastFailed {
                reason: format!("allowance read failed: {e}"),
            })?;

        if current >= required {
            return Ok(());
        }

        if current > U256::ZERO {
            info!(network_id, %spender, "resetting stale allowance to zero before re-approval");
            let reset = erc20.approve(spender, U256::ZERO).into_transaction_request();
            ctx.executor
                .execute(reset, &ctx.gas_overrides)
                .await
                .map_err(|source| TransferError::Execution { source })?;
        }

        let approve = erc20.approve(spender, U256::MAX).into_transaction_request();
        ctx.executor
            .execute(approve, &ctx.gas_overrides)
            .await
            .map_err(|source| TransferError::Execution { source })?;
        Ok(())
    }
}

#[async_trait]
impl TransferStrategy for EvmTransferStrategy {
    async fn transfer(&self, params: &TransferParams) -> Result<TransferOutcome> {
        let network_id = params.token.network_id.clone();
        let ctx = self.network(&network_id)?.clone();

        let to: Address =
            params
                .to_address
                .parse()
                .map_err(|_| TransferError::InvalidAddress {
                    address: params.to_address.clone(),
                    reason: "not an EVM address".to_string(),
                })?;

        let is_native = params.token.is_native();
        let token: Address = if is_native {
            Address::ZERO
        } else {
            params
                .token
                .address
                .parse()
                .map_err(|_| TransferError::InvalidAddress {
                    address: params.token.address.clone(),
                    reason: "not an EVM token address".to_string(),
                })?
        };

        let payment_config = self
            .router
            .get_asset_chain_config(&network_id, AssetChainRole::Payment)
            .await
            .map_err(|source| TransferError::RouterLookup { source })?;
        let payment_contract: Address =
            payment_config
                .contract_address
                .parse()
                .map_err(|_| TransferError::InvalidAddress {
                    address: payment_config.contract_address.clone(),
                    reason: "payment contract address from router is malformed".to_string(),
                })?;

        if !is_native {
            self.ensure_balance(&ctx, &network_id, token, params.amount, &params.token.symbol)
                .await?;
            self.ensure_allowance(&ctx, &network_id, token, payment_contract, params.amount)
                .await?;
        }

        let fee_details = self
            .router
            .get_fee_details(&params.trade_id)
            .await
            .map_err(|source| TransferError::RouterLookup { source })?;

        let deadline = Utc::now().timestamp() + PAYMENT_DEADLINE_SECS;
        let trade_id =
            hex_to_b256(&params.trade_id).map_err(|e| TransferError::InvalidAddress {
                address: params.trade_id.clone(),
                reason: e.to_string(),
            })?;

        let contract = IPaymentRouter::new(payment_contract, &ctx.provider);
        let mut tx = contract
            .payment(
                trade_id,
                token,
                to,
                params.amount,
                fee_details.protocol_fee,
                U256::from(deadline as u64),
            )
            .into_transaction_request();
        if is_native {
            tx.value = Some(params.amount);
        }

        info!(
            trade_id = params.trade_id,
            network_id,
            to = %to,
            amount = %params.amount,
            "executing EVM settlement payment"
        );

        match ctx.executor.execute(tx, &ctx.gas_overrides).await {
            Ok(executed) => Ok(TransferOutcome::Submitted {
                hash: format!("{:#x}", executed.hash),
                gas: executed.gas,
            }),
            Err(e) => {
                let reason = e.to_string();
                if let Some(decoded) = decode_revert_reason(&reason) {
                    warn!(
                        trade_id = params.trade_id,
                        revert_reason = decoded,
                        "payment contract reverted"
                    );
                    return Err(TransferError::BroadcastFailed {
                        reason: format!("payment reverted: {decoded}"),
                    });
                }
                Err(TransferError::Execution { source: e })
            }
        }
    }
}
