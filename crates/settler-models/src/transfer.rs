use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::Token;

/// Inputs to a chain transfer strategy. Built per call, never persisted.
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub to_address: String,
    pub amount: U256,
    pub token: Token,
    pub trade_id: String,
}

/// Gas accounting attached to an EVM submission; other chains leave it unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasReceipt {
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    #[serde(with = "u256_decimal_opt", default)]
    pub gas_price: Option<U256>,
    #[serde(with = "u256_decimal_opt", default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(with = "u256_decimal_opt", default)]
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Result of a transfer attempt.
///
/// `Reverted` exists for the liquidation path, where the contract rejecting a
/// payment still has to yield a hash-shaped value for manual reconciliation
/// downstream. The selector is kept explicit instead of being smuggled inside
/// a fake hash string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferOutcome {
    Submitted {
        hash: String,
        #[serde(default)]
        gas: GasReceipt,
    },
    Reverted {
        /// 4-byte error selector, 0x-prefixed hex.
        selector: String,
    },
}

impl TransferOutcome {
    pub fn submitted(hash: impl Into<String>) -> Self {
        TransferOutcome::Submitted {
            hash: hash.into(),
            gas: GasReceipt::default(),
        }
    }

    /// Transaction id reported to the solver: the real hash for submissions,
    /// or the 4-byte selector zero-padded to 32 bytes for reverted
    /// liquidation payments.
    pub fn settlement_tx_id(&self) -> String {
        match self {
            TransferOutcome::Submitted { hash, .. } => hash.clone(),
            TransferOutcome::Reverted { selector } => {
                let bare = selector.trim_start_matches("0x");
                format!("0x{bare:0<64}")
            }
        }
    }
}

mod u256_decimal_opt {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        match opt {
            Some(s) => s
                .parse::<U256>()
                .or_else(|_| U256::from_str_radix(s.trim_start_matches("0x"), 16))
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_tx_id_passes_through_real_hash() {
        let outcome = TransferOutcome::submitted("0xdeadbeef");
        assert_eq!(outcome.settlement_tx_id(), "0xdeadbeef");
    }

    #[test]
    fn settlement_tx_id_pads_selector_to_32_bytes() {
        let outcome = TransferOutcome::Reverted {
            selector: "0x08c379a0".to_string(),
        };
        let id = outcome.settlement_tx_id();
        assert_eq!(id.len(), 66);
        assert!(id.starts_with("0x08c379a0"));
        assert!(id.ends_with("0000"));
    }
}
