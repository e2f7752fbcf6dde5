//! Settlement signatures. Both hashes are EIP-712 typed structs the on-chain
//! verifier checks bit-for-bit: `CommitInfo` binds this PMM to a receiving
//! address, destination chain/token, amount and deadline; `MakePaymentInfo`
//! proves a settlement transfer to the solver. The `SignatureType`
//! discriminator picks the signing domain: `MakePayment` is scoped by name
//! and version only, `VerifyingContract` additionally binds the chain id and
//! the router contract.

use alloy::primitives::{Address, B256, Bytes, FixedBytes, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};
use snafu::Snafu;

const DOMAIN_NAME: &str = "pmm-settlement";
const DOMAIN_VERSION: &str = "1";

sol! {
    struct CommitInfo {
        bytes32 pmmId;
        bytes pmmRecvAddress;
        bytes toChainNetworkId;
        bytes toChainToken;
        uint256 amountOut;
        uint256 deadline;
    }

    struct MakePaymentInfo {
        bytes32[] tradeIds;
        uint256 signedAt;
        uint256 startIndex;
        bytes paymentTxId;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    MakePayment,
    VerifyingContract,
}

#[derive(Debug, Snafu)]
pub enum SigningError {
    #[snafu(display("Invalid hex identifier {value}: {reason}"))]
    InvalidHexId { value: String, reason: String },

    #[snafu(display("Signature failed: {source}"))]
    SignatureFailed { source: alloy::signers::Error },
}

pub type Result<T, E = SigningError> = std::result::Result<T, E>;

/// Parse a 0x-prefixed hex id of at most 32 bytes, left-padded to `bytes32`.
pub fn hex_to_b256(value: &str) -> Result<B256> {
    let bytes =
        alloy::hex::decode(value.trim_start_matches("0x")).map_err(|e| SigningError::InvalidHexId {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if bytes.len() > 32 {
        return Err(SigningError::InvalidHexId {
            value: value.to_string(),
            reason: format!("{} bytes does not fit bytes32", bytes.len()),
        });
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(FixedBytes(padded))
}

/// Signs commit and make-payment hashes with the operator key.
pub struct SettlementSigner {
    signer: PrivateKeySigner,
    chain_id: u64,
    /// The router contract, bound into `VerifyingContract`-scoped domains.
    verifying_contract: Address,
}

impl SettlementSigner {
    pub fn new(signer: PrivateKeySigner, chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            signer,
            chain_id,
            verifying_contract,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn domain(&self, sig_type: SignatureType) -> Eip712Domain {
        match sig_type {
            SignatureType::MakePayment => eip712_domain! {
                name: DOMAIN_NAME,
                version: DOMAIN_VERSION,
            },
            SignatureType::VerifyingContract => eip712_domain! {
                name: DOMAIN_NAME,
                version: DOMAIN_VERSION,
                chain_id: self.chain_id,
                verifying_contract: self.verifying_contract,
            },
        }
    }

    /// Hash + sign the commitment binding for `get_settlement_signature`.
    /// Addresses ride as their canonical string form in UTF-8 bytes; that is
    /// what the verifier hashes too, and it is chain-family agnostic.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_commit_info(
        &self,
        pmm_id: &str,
        pmm_recv_address: &str,
        to_chain_network_id: &str,
        to_chain_token: &str,
        amount_out: U256,
        deadline: i64,
    ) -> Result<String> {
        let info = CommitInfo {
            pmmId: hex_to_b256(pmm_id)?,
            pmmRecvAddress: Bytes::from(pmm_recv_address.as_bytes().to_vec()),
            toChainNetworkId: Bytes::from(to_chain_network_id.as_bytes().to_vec()),
            toChainToken: Bytes::from(to_chain_token.as_bytes().to_vec()),
            amountOut: amount_out,
            deadline: U256::from(deadline as u64),
        };
        let hash = info.eip712_signing_hash(&self.domain(SignatureType::VerifyingContract));
        self.sign_prehash(hash)
    }

    /// Hash + sign the settlement proof for the submit stage.
    pub fn sign_make_payment(
        &self,
        trade_ids: &[String],
        signed_at: i64,
        start_index: u64,
        payment_tx_id: &str,
    ) -> Result<String> {
        let ids = trade_ids
            .iter()
            .map(|id| hex_to_b256(id))
            .collect::<Result<Vec<_>>>()?;
        let info = MakePaymentInfo {
            tradeIds: ids,
            signedAt: U256::from(signed_at as u64),
            startIndex: U256::from(start_index),
            paymentTxId: Bytes::from(payment_tx_id.as_bytes().to_vec()),
        };
        let hash = info.eip712_signing_hash(&self.domain(SignatureType::MakePayment));
        self.sign_prehash(hash)
    }

    fn sign_prehash(&self, hash: B256) -> Result<String> {
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|source| SigningError::SignatureFailed { source })?;
        Ok(format!("0x{}", alloy::hex::encode(signature.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn test_signer() -> SettlementSigner {
        let signer = PrivateKeySigner::from_str(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        SettlementSigner::new(
            signer,
            8453,
            Address::from_str("0x2222222222222222222222222222222222222222").unwrap(),
        )
    }

    #[test]
    fn pads_short_trade_ids_to_bytes32() {
        let b = hex_to_b256("0xabc1").unwrap();
        assert_eq!(&b[..30], &[0u8; 30]);
        assert_eq!(b[30], 0xab);
        assert_eq!(b[31], 0xc1);
    }

    #[test]
    fn rejects_overlong_ids() {
        let too_long = format!("0x{}", "11".repeat(33));
        assert!(hex_to_b256(&too_long).is_err());
    }

    #[test]
    fn commit_signature_recovers_operator_address() {
        let signer = test_signer();
        let sig_hex = signer
            .sign_commit_info(
                "0x01",
                "bc1pexampleaddress",
                "8453",
                "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                U256::from(250_000_000u64),
                1_700_001_800,
            )
            .unwrap();

        let info = CommitInfo {
            pmmId: hex_to_b256("0x01").unwrap(),
            pmmRecvAddress: Bytes::from("bc1pexampleaddress".as_bytes().to_vec()),
            toChainNetworkId: Bytes::from("8453".as_bytes().to_vec()),
            toChainToken: Bytes::from(
                "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".as_bytes().to_vec(),
            ),
            amountOut: U256::from(250_000_000u64),
            deadline: U256::from(1_700_001_800u64),
        };
        let hash = info.eip712_signing_hash(&signer.domain(SignatureType::VerifyingContract));

        let sig_bytes = alloy::hex::decode(sig_hex.trim_start_matches("0x")).unwrap();
        let signature = alloy::primitives::Signature::from_raw(&sig_bytes).unwrap();
        let recovered = signature.recover_address_from_prehash(&hash).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn domains_are_distinct_per_signature_type() {
        let signer = test_signer();
        let make_payment = signer.domain(SignatureType::MakePayment);
        let verifying = signer.domain(SignatureType::VerifyingContract);
        assert_ne!(make_payment.hash_struct(), verifying.hash_struct());
    }

    #[test]
    fn make_payment_signature_changes_with_tx_id() {
        let signer = test_signer();
        let a = signer
            .sign_make_payment(&["0xabc".to_string()], 1_700_000_000, 0, "0xdeadbeef")
            .unwrap();
        let b = signer
            .sign_make_payment(&["0xabc".to_string()], 1_700_000_000, 0, "0xfeedface")
            .unwrap();
        assert_ne!(a, b);
    }
}
