use bitcoin::key::{Keypair, TapTweak, TweakedKeypair};
use bitcoin::secp256k1::{All, Secp256k1, XOnlyPublicKey};
use bitcoin::{Address, Network, NetworkKind, PrivateKey, ScriptBuf};
use snafu::Snafu;
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum BitcoinKeyError {
    #[snafu(display("Invalid WIF private key: {}", source))]
    InvalidWif { source: bitcoin::key::FromWifError },
}

pub type Result<T, E = BitcoinKeyError> = std::result::Result<T, E>;

/// The PMM's Taproot wallet keys: the untweaked keypair, its x-only public
/// key, and the derived key-path-only P2TR address.
pub struct TaprootKeys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    pub x_only: XOnlyPublicKey,
    pub address: Address,
    pub network: Network,
}

impl TaprootKeys {
    /// Derive from a WIF string for the configured network.
    ///
    /// WIF encodes a mainnet/testnet prefix of its own; operators routinely
    /// hold a key exported for the wrong network, so a prefix mismatch is
    /// re-keyed onto `network` rather than rejected. The underlying secret is
    /// identical either way.
    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let parsed = PrivateKey::from_wif(wif).map_err(|source| BitcoinKeyError::InvalidWif {
            source,
        })?;

        let private_key = if parsed.network != NetworkKind::from(network) {
            warn!(
                wif_network = ?parsed.network,
                configured_network = ?network,
                "WIF network prefix does not match configured network, re-keying"
            );
            PrivateKey::new(parsed.inner, network)
        } else {
            parsed
        };

        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &private_key.inner);
        let (x_only, _parity) = XOnlyPublicKey::from_keypair(&keypair);

        // Key-path-only Taproot output (no script tree)
        let address = Address::p2tr(&secp, x_only, None, network);

        Ok(Self {
            secp,
            keypair,
            x_only,
            address,
            network,
        })
    }

    /// The tweaked keypair used for key-path spends: the BIP341 tweak
    /// `taggedHash("TapTweak", xOnlyPubkey)` applied to the internal key.
    pub fn tweaked_keypair(&self) -> TweakedKeypair {
        self.keypair.tap_tweak(&self.secp, None)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known compressed-key WIF from the Bitcoin wiki test vectors.
    const MAINNET_WIF: &str = "L1aW4aubDFB7yfras2S1mN3bqg9nwySY8nkoLmJebSLD5BWv3ENZ";

    #[test]
    fn derives_mainnet_p2tr_address() {
        let keys = TaprootKeys::from_wif(MAINNET_WIF, Network::Bitcoin).unwrap();
        let addr = keys.address.to_string();
        assert!(addr.starts_with("bc1p"), "expected P2TR bech32m, got {addr}");
    }

    #[test]
    fn mismatched_wif_network_is_rekeyed_not_rejected() {
        let mainnet = TaprootKeys::from_wif(MAINNET_WIF, Network::Bitcoin).unwrap();
        let testnet = TaprootKeys::from_wif(MAINNET_WIF, Network::Testnet).unwrap();

        // same underlying secret, different encoding networks
        assert_eq!(mainnet.x_only, testnet.x_only);
        assert!(testnet.address.to_string().starts_with("tb1p"));
        assert_ne!(mainnet.address, testnet.address);
    }

    #[test]
    fn rejects_garbage_wif() {
        assert!(TaprootKeys::from_wif("not-a-wif", Network::Bitcoin).is_err());
    }

    #[test]
    fn tweaked_key_differs_from_internal_key() {
        let keys = TaprootKeys::from_wif(MAINNET_WIF, Network::Bitcoin).unwrap();
        let tweaked = keys.tweaked_keypair();
        assert_ne!(
            tweaked.to_inner().secret_bytes(),
            Keypair::from_secret_key(
                keys.secp(),
                &PrivateKey::from_wif(MAINNET_WIF).unwrap().inner
            )
            .secret_bytes()
        );
    }
}
