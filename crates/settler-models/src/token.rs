use serde::{Deserialize, Serialize};

use crate::NetworkType;

/// A token known to the directory service, keyed either by its opaque
/// `token_id` or by `(network_id, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    /// Chain identifier within its family (e.g. an EVM chain id as a string,
    /// "bitcoin", "bitcoin-testnet", "solana").
    pub network_id: String,
    pub network_type: NetworkType,
    /// Contract/mint address; the native-asset sentinel for BTC.
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Token {
    /// Native-asset sentinel used in place of a contract address.
    pub const NATIVE: &'static str = "native";

    pub fn is_native(&self) -> bool {
        self.address == Self::NATIVE
    }
}
