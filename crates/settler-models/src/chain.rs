use serde::{Deserialize, Serialize};

/// Chain family a token settles on. `Tbtc` is Bitcoin testnet; it shares the
/// Bitcoin transfer path but derives testnet addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkType {
    Evm,
    Btc,
    Tbtc,
    Solana,
}

impl NetworkType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            NetworkType::Evm => "EVM",
            NetworkType::Btc => "BTC",
            NetworkType::Tbtc => "TBTC",
            NetworkType::Solana => "SOLANA",
        }
    }

    pub fn from_db_string(s: &str) -> Option<NetworkType> {
        match s {
            "EVM" => Some(NetworkType::Evm),
            "BTC" => Some(NetworkType::Btc),
            "TBTC" => Some(NetworkType::Tbtc),
            "SOLANA" => Some(NetworkType::Solana),
            _ => None,
        }
    }

    /// True for either Bitcoin flavor.
    pub fn is_bitcoin(&self) -> bool {
        matches!(self, NetworkType::Btc | NetworkType::Tbtc)
    }

    /// Chain family for a router network id. Non-EVM families use symbolic
    /// ids; everything numeric is an EVM chain id.
    pub fn of_network_id(network_id: &str) -> NetworkType {
        match network_id {
            "BTC" => NetworkType::Btc,
            "TBTC" => NetworkType::Tbtc,
            "SOLANA" => NetworkType::Solana,
            _ => NetworkType::Evm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Swap,
    Liquid,
    Lending,
}

impl TradeType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            TradeType::Swap => "SWAP",
            TradeType::Liquid => "LIQUID",
            TradeType::Lending => "LENDING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_type_round_trips_through_db_string() {
        for nt in [
            NetworkType::Evm,
            NetworkType::Btc,
            NetworkType::Tbtc,
            NetworkType::Solana,
        ] {
            assert_eq!(NetworkType::from_db_string(nt.to_db_string()), Some(nt));
        }
        assert_eq!(NetworkType::from_db_string("COSMOS"), None);
    }

    #[test]
    fn network_ids_map_to_families() {
        assert_eq!(NetworkType::of_network_id("BTC"), NetworkType::Btc);
        assert_eq!(NetworkType::of_network_id("TBTC"), NetworkType::Tbtc);
        assert_eq!(NetworkType::of_network_id("SOLANA"), NetworkType::Solana);
        assert_eq!(NetworkType::of_network_id("1"), NetworkType::Evm);
        assert_eq!(NetworkType::of_network_id("8453"), NetworkType::Evm);
    }

    #[test]
    fn tbtc_is_bitcoin() {
        assert!(NetworkType::Btc.is_bitcoin());
        assert!(NetworkType::Tbtc.is_bitcoin());
        assert!(!NetworkType::Evm.is_bitcoin());
        assert!(!NetworkType::Solana.is_bitcoin());
    }
}
