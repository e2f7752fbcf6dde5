use snafu::Snafu;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;

#[derive(Debug, Snafu)]
pub enum SolanaKeyError {
    #[snafu(display("Invalid Solana keypair encoding: {reason}"))]
    InvalidKeypair { reason: String },
}

pub type Result<T, E = SolanaKeyError> = std::result::Result<T, E>;

/// Parse a base58-encoded 64-byte keypair (the common wallet export format).
pub fn keypair_from_base58(encoded: &str) -> Result<Keypair> {
    let bytes = solana_sdk::bs58::decode(encoded)
        .into_vec()
        .map_err(|e| SolanaKeyError::InvalidKeypair {
            reason: e.to_string(),
        })?;
    Keypair::try_from(bytes.as_slice()).map_err(|e| SolanaKeyError::InvalidKeypair {
        reason: e.to_string(),
    })
}

pub fn pubkey_from_base58(encoded: &str) -> Result<Pubkey> {
    Ok(keypair_from_base58(encoded)?.pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_generated_keypair() {
        let keypair = Keypair::new();
        let encoded = keypair.to_base58_string();
        let parsed = keypair_from_base58(&encoded).unwrap();
        assert_eq!(parsed.pubkey(), keypair.pubkey());
    }

    #[test]
    fn rejects_garbage() {
        assert!(keypair_from_base58("0OIl").is_err());
        assert!(keypair_from_base58("abc").is_err());
    }
}
