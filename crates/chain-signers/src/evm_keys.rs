use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum EvmKeyError {
    #[snafu(display("Invalid EVM private key hex: {reason}"))]
    InvalidKey { reason: String },
}

pub type Result<T, E = EvmKeyError> = std::result::Result<T, E>;

/// Parse a 0x-prefixed (or bare) 32-byte hex private key into a signer.
pub fn signer_from_hex(key_hex: &str) -> Result<PrivateKeySigner> {
    let bytes = alloy::hex::decode(key_hex.trim_start_matches("0x")).map_err(|e| {
        EvmKeyError::InvalidKey {
            reason: e.to_string(),
        }
    })?;
    if bytes.len() != 32 {
        return Err(EvmKeyError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        });
    }
    PrivateKeySigner::from_slice(&bytes).map_err(|e| EvmKeyError::InvalidKey {
        reason: e.to_string(),
    })
}

/// The checksummed address a key controls, without keeping the signer around.
pub fn address_from_hex(key_hex: &str) -> Result<Address> {
    Ok(signer_from_hex(key_hex)?.address())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hardhat's first default account
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn derives_known_address() {
        let addr = address_from_hex(KEY).unwrap();
        assert_eq!(addr.to_string(), ADDR);
    }

    #[test]
    fn accepts_bare_hex() {
        let addr = address_from_hex(KEY.trim_start_matches("0x")).unwrap();
        assert_eq!(addr.to_string(), ADDR);
    }

    #[test]
    fn rejects_short_key() {
        assert!(signer_from_hex("0xdeadbeef").is_err());
    }
}
