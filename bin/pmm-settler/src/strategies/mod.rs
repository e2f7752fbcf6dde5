//! Chain transfer strategies and their factory.
//!
//! A strategy owns the full "move the destination asset to the user" path for
//! one (network family, trade type) combination. The factory is a plain
//! lookup table resolved once at startup; nothing is dispatched reflectively.

mod bitcoin_engine;
mod evm;
mod evm_liquidation;
mod solana;

pub use bitcoin_engine::{BitcoinTransferStrategy, BtcEngineConfig};
pub use evm::{EvmNetworkCtx, EvmTransferStrategy};
pub use evm_liquidation::{LiquidationTransferStrategy, LiquidationVaultConfig};
pub use solana::SolanaTransferStrategy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use settler_models::{NetworkType, TradeType, TransferOutcome, TransferParams};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum TransferError {
    #[snafu(display(
        "Insufficient balance for {token}: required {required}, available {available}"
    ))]
    InsufficientBalance {
        token: String,
        required: String,
        available: String,
    },

    #[snafu(display("No transfer strategy for {:?}/{:?}", network, trade_type))]
    UnsupportedCombination {
        network: NetworkType,
        trade_type: TradeType,
    },

    #[snafu(display("Unsupported token {token} on this strategy: {reason}"))]
    UnsupportedToken { token: String, reason: String },

    #[snafu(display("Invalid address {address}: {reason}"))]
    InvalidAddress { address: String, reason: String },

    #[snafu(display("Router lookup failed: {source}"))]
    RouterLookup { source: router_client::RouterClientError },

    #[snafu(display("Transaction execution failed: {source}"))]
    Execution {
        source: crate::evm::tx_executor::ExecutorError,
    },

    #[snafu(display("Bitcoin data access failed: {source}"))]
    BitcoinData {
        source: resilient_providers::BitcoinDataError,
    },

    #[snafu(display("Broadcast failed: {reason}"))]
    BroadcastFailed { reason: String },

    #[snafu(display("Misconfigured strategy: {reason}"))]
    Misconfigured { reason: String },
}

impl TransferError {
    /// Permanent failures stop the pipeline for this trade instead of being
    /// retried: retrying cannot fund a wallet or fix an address.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::InsufficientBalance { .. }
                | TransferError::UnsupportedCombination { .. }
                | TransferError::UnsupportedToken { .. }
                | TransferError::InvalidAddress { .. }
                | TransferError::Misconfigured { .. }
        )
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[async_trait]
pub trait TransferStrategy: Send + Sync {
    async fn transfer(&self, params: &TransferParams) -> Result<TransferOutcome>;
}

/// Startup-resolved table of `(NetworkType, TradeType) → strategy`.
pub struct TransferStrategyFactory {
    strategies: HashMap<(NetworkType, TradeType), Arc<dyn TransferStrategy>>,
}

impl TransferStrategyFactory {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        network: NetworkType,
        trade_type: TradeType,
        strategy: Arc<dyn TransferStrategy>,
    ) {
        self.strategies.insert((network, trade_type), strategy);
    }

    /// Register one strategy for every trade type on a network. Specific
    /// combinations (e.g. EVM liquidation) can be overridden afterwards.
    pub fn register_all_trade_types(
        &mut self,
        network: NetworkType,
        strategy: Arc<dyn TransferStrategy>,
    ) {
        for trade_type in [TradeType::Swap, TradeType::Liquid, TradeType::Lending] {
            self.strategies.insert((network, trade_type), strategy.clone());
        }
    }

    pub fn get_strategy(
        &self,
        network: NetworkType,
        trade_type: TradeType,
    ) -> Result<Arc<dyn TransferStrategy>> {
        self.strategies
            .get(&(network, trade_type))
            .cloned()
            .ok_or(TransferError::UnsupportedCombination {
                network,
                trade_type,
            })
    }
}

impl Default for TransferStrategyFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull the 4-byte error selector out of an RPC failure message, if the node
/// echoed revert data. Returns 0x-prefixed 8-hex-char selectors only.
pub(crate) fn extract_revert_selector(reason: &str) -> Option<String> {
    for (idx, _) in reason.match_indices("0x") {
        let hex_part: String = reason[idx + 2..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        if hex_part.len() >= 8 {
            return Some(format!("0x{}", &hex_part[..8].to_ascii_lowercase()));
        }
    }
    None
}

/// Best-effort decode of a `Error(string)` revert payload embedded in an RPC
/// failure message, for diagnostics.
pub(crate) fn decode_revert_reason(reason: &str) -> Option<String> {
    let idx = reason.find("0x08c379a0")?;
    let hex_part: String = reason[idx + 2..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    let data = alloy::hex::decode(&hex_part).ok()?;
    // selector (4) + offset (32) + length (32) + bytes
    if data.len() < 68 {
        return None;
    }
    let len = u64::from_be_bytes(data[60..68].try_into().ok()?) as usize;
    let start: usize = 68;
    let end = start.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    String::from_utf8(data[start..end].to_vec()).ok()
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::MockStrategy;
    use super::*;

    #[test]
    fn factory_resolves_exact_combination() {
        let mut factory = TransferStrategyFactory::new();
        factory.register_all_trade_types(
            NetworkType::Evm,
            Arc::new(MockStrategy::succeeding("0x1")),
        );
        factory.register(
            NetworkType::Evm,
            TradeType::Liquid,
            Arc::new(MockStrategy::succeeding("0x2")),
        );

        assert!(factory
            .get_strategy(NetworkType::Evm, TradeType::Swap)
            .is_ok());
        assert!(factory
            .get_strategy(NetworkType::Evm, TradeType::Liquid)
            .is_ok());
        let err = factory
            .get_strategy(NetworkType::Solana, TradeType::Swap)
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::UnsupportedCombination { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn extracts_selector_from_rpc_error() {
        let msg = "execution reverted, data: 0xfb8f41b200000000000000000000000000000000";
        assert_eq!(
            extract_revert_selector(msg),
            Some("0xfb8f41b2".to_string())
        );
        assert_eq!(extract_revert_selector("connection refused"), None);
        // too-short hex blobs are not selectors
        assert_eq!(extract_revert_selector("code 0xdead"), None);
    }

    #[test]
    fn decodes_error_string_revert() {
        // Error("insufficient allowance")
        let payload = {
            let msg = b"insufficient allowance";
            let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
            let mut offset = [0u8; 32];
            offset[31] = 0x20;
            data.extend_from_slice(&offset);
            let mut len = [0u8; 32];
            len[24..].copy_from_slice(&(msg.len() as u64).to_be_bytes());
            data.extend_from_slice(&len);
            data.extend_from_slice(msg);
            format!("server returned: 0x{}", alloy::hex::encode(data))
        };
        assert_eq!(
            decode_revert_reason(&payload),
            Some("insufficient allowance".to_string())
        );
    }
}
