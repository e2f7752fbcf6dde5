/// Serde helpers for U256 fields that must round-trip as decimal strings
/// (store rows and solver payloads both expect numeric strings, not hex).
pub mod u256_decimal {
    use alloy::primitives::U256;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // Decimal first, hex as a fallback for legacy rows
        s.parse::<U256>()
            .or_else(|_| U256::from_str_radix(s.trim_start_matches("0x"), 16))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::u256_decimal")]
        amount: U256,
    }

    #[test]
    fn serializes_as_decimal_string() {
        let w = Wrapper {
            amount: U256::from(123_456_789u64),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"amount":"123456789"}"#);
    }

    #[test]
    fn deserializes_decimal_and_hex() {
        let w: Wrapper = serde_json::from_str(r#"{"amount":"1000"}"#).unwrap();
        assert_eq!(w.amount, U256::from(1000u64));

        let w: Wrapper = serde_json::from_str(r#"{"amount":"0x3e8"}"#).unwrap();
        assert_eq!(w.amount, U256::from(1000u64));
    }
}
