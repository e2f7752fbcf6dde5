//! Bitcoin settlement transfers: UTXO selection, PSBT construction, Taproot
//! key-path signing, and broadcast through the resilient provider client.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use chain_signers::bitcoin_keys::TaprootKeys;
use resilient_providers::{BitcoinDataClient, Utxo};
use settler_models::{TransferOutcome, TransferParams};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::strategies::{Result, TransferError, TransferStrategy};

/// Outputs below this are unspendable dust; change under it is folded into
/// the fee instead of being emitted.
pub const DUST_LIMIT_SATS: u64 = 546;

// Worst-case vbyte costs for P2TR key-path spends.
const TX_OVERHEAD_VBYTES: f64 = 10.5;
const INPUT_VBYTES: f64 = 57.5;
const OUTPUT_VBYTES: f64 = 43.0;

#[derive(Debug, Clone)]
pub struct BtcEngineConfig {
    /// Spend unconfirmed UTXOs when explicitly allowed (default off).
    pub allow_unconfirmed: bool,
    /// Ceiling on the applied fee rate in sat/vB.
    pub max_fee_rate: f64,
}

impl Default for BtcEngineConfig {
    fn default() -> Self {
        Self {
            allow_unconfirmed: false,
            max_fee_rate: 100.0,
        }
    }
}

/// A fully planned spend: which inputs, what fee, whether change is emitted.
#[derive(Debug, Clone)]
pub struct TxPlan {
    pub selected: Vec<Utxo>,
    pub fee_sats: u64,
    /// Zero means no change output (folded into the fee when below dust).
    pub change_sats: u64,
}

fn estimate_vbytes(inputs: usize, outputs: usize) -> f64 {
    TX_OVERHEAD_VBYTES + INPUT_VBYTES * inputs as f64 + OUTPUT_VBYTES * outputs as f64
}

fn fee_for(inputs: usize, outputs: usize, fee_rate: f64) -> u64 {
    (estimate_vbytes(inputs, outputs) * fee_rate).ceil() as u64
}

/// Largest-first accumulation until `amount + fee` is covered. The fee is
/// recomputed as inputs are added; a sub-dust change remainder is absorbed
/// into the fee rather than emitted. Rejects outright (no partial send) when
/// the wallet cannot cover the full amount plus fee.
pub fn plan_transaction(mut utxos: Vec<Utxo>, amount_sats: u64, fee_rate: f64) -> Result<TxPlan> {
    utxos.sort_by(|a, b| b.value.cmp(&a.value));
    let available: u64 = utxos.iter().map(|u| u.value).sum();

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total: u64 = 0;

    for utxo in utxos {
        total += utxo.value;
        selected.push(utxo);

        // recipient + change + OP_RETURN
        let fee_with_change = fee_for(selected.len(), 3, fee_rate);
        if total < amount_sats.saturating_add(fee_with_change) {
            continue;
        }

        let change = total - amount_sats - fee_with_change;
        if change < DUST_LIMIT_SATS {
            // Drop the change output; the remainder rides as extra fee.
            return Ok(TxPlan {
                selected,
                fee_sats: total - amount_sats,
                change_sats: 0,
            });
        }
        return Ok(TxPlan {
            selected,
            fee_sats: fee_with_change,
            change_sats: change,
        });
    }

    let required = amount_sats.saturating_add(fee_for(selected.len().max(1), 3, fee_rate));
    Err(TransferError::InsufficientBalance {
        token: "BTC".to_string(),
        required: required.to_string(),
        available: available.to_string(),
    })
}

/// 32-byte correlation digest embedded in the OP_RETURN output.
fn trade_correlation_digest(trade_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(trade_id.as_bytes());
    hasher.finalize().into()
}

fn op_return_script(digest: &[u8; 32]) -> ScriptBuf {
    bitcoin::script::Builder::new()
        .push_opcode(bitcoin::opcodes::all::OP_RETURN)
        .push_slice(digest)
        .into_script()
}

pub struct BitcoinTransferStrategy {
    keys: TaprootKeys,
    client: Arc<BitcoinDataClient>,
    notifier: Arc<dyn Notifier>,
    config: BtcEngineConfig,
}

impl BitcoinTransferStrategy {
    pub fn new(
        keys: TaprootKeys,
        client: Arc<BitcoinDataClient>,
        notifier: Arc<dyn Notifier>,
        config: BtcEngineConfig,
    ) -> Self {
        Self {
            keys,
            client,
            notifier,
            config,
        }
    }

    fn build_and_sign(
        &self,
        plan: &TxPlan,
        recipient: &Address,
        amount_sats: u64,
        trade_id: &str,
    ) -> Result<Transaction> {
        let inputs = plan
            .selected
            .iter()
            .map(|utxo| {
                let txid = Txid::from_str(&utxo.txid).map_err(|e| TransferError::BroadcastFailed {
                    reason: format!("provider returned malformed txid {}: {e}", utxo.txid),
                })?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, utxo.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: recipient.script_pubkey(),
        }];
        if plan.change_sats > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(plan.change_sats),
                script_pubkey: self.keys.script_pubkey(),
            });
        }
        let digest = trade_correlation_digest(trade_id);
        outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: op_return_script(&digest),
        });

        let unsigned = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        let mut psbt =
            Psbt::from_unsigned_tx(unsigned.clone()).map_err(|e| TransferError::BroadcastFailed {
                reason: format!("psbt construction failed: {e}"),
            })?;

        let prevouts: Vec<TxOut> = plan
            .selected
            .iter()
            .map(|utxo| TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: self.keys.script_pubkey(),
            })
            .collect();

        for (i, prevout) in prevouts.iter().enumerate() {
            psbt.inputs[i].witness_utxo = Some(prevout.clone());
            psbt.inputs[i].tap_internal_key = Some(self.keys.x_only);
        }

        // Key-path signing with the tweaked keypair.
        let signing_keypair = self.keys.tweaked_keypair().to_inner();
        let mut sighash_cache = SighashCache::new(&unsigned);
        for i in 0..plan.selected.len() {
            let sighash = sighash_cache
                .taproot_key_spend_signature_hash(
                    i,
                    &Prevouts::All(&prevouts),
                    TapSighashType::Default,
                )
                .map_err(|e| TransferError::BroadcastFailed {
                    reason: format!("sighash computation failed: {e}"),
                })?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = self
                .keys
                .secp()
                .sign_schnorr_no_aux_rand(&msg, &signing_keypair);
            let taproot_sig = bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            };
            psbt.inputs[i].final_script_witness = Some(Witness::p2tr_key_spend(&taproot_sig));
        }

        psbt.extract_tx().map_err(|e| TransferError::BroadcastFailed {
            reason: format!("psbt extraction failed: {e}"),
        })
    }
}

#[async_trait]
impl TransferStrategy for BitcoinTransferStrategy {
    async fn transfer(&self, params: &TransferParams) -> Result<TransferOutcome> {
        if !params.token.network_type.is_bitcoin() || !params.token.is_native() {
            return Err(TransferError::UnsupportedToken {
                token: params.token.symbol.clone(),
                reason: "bitcoin strategy only settles native BTC".to_string(),
            });
        }

        let recipient = Address::from_str(&params.to_address)
            .map_err(|e| TransferError::InvalidAddress {
                address: params.to_address.clone(),
                reason: e.to_string(),
            })?
            .require_network(self.keys.network)
            .map_err(|_| TransferError::InvalidAddress {
                address: params.to_address.clone(),
                reason: format!("not valid for network {:?}", self.keys.network),
            })?;

        let amount_sats = params.amount.to::<u64>();

        let all_utxos = self
            .client
            .get_address_utxos(&self.keys.address.to_string())
            .await
            .map_err(|source| TransferError::BitcoinData { source })?;
        let spendable: Vec<Utxo> = all_utxos
            .into_iter()
            .filter(|u| self.config.allow_unconfirmed || u.status.confirmed)
            .collect();

        let recommended = self.client.recommended_fee_rate().await;
        let fee_rate = recommended.min(self.config.max_fee_rate);

        let plan = match plan_transaction(spendable, amount_sats, fee_rate) {
            Ok(plan) => plan,
            Err(e @ TransferError::InsufficientBalance { .. }) => {
                self.notifier
                    .send_message(&format!(
                        "BTC wallet {} cannot cover settlement of {amount_sats} sats for trade {}: {e}. Manual top-up required.",
                        self.keys.address, params.trade_id
                    ))
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!(
            trade_id = params.trade_id,
            inputs = plan.selected.len(),
            fee_sats = plan.fee_sats,
            change_sats = plan.change_sats,
            fee_rate,
            "built BTC settlement plan"
        );

        let tx = self.build_and_sign(&plan, &recipient, amount_sats, &params.trade_id)?;
        let tx_hex = alloy::hex::encode(bitcoin::consensus::serialize(&tx));

        let txid = self
            .client
            .broadcast_tx(&tx_hex)
            .await
            .map_err(|source| TransferError::BitcoinData { source })?;

        if txid != tx.compute_txid().to_string() {
            // Providers echo the txid back; a mismatch means something is off
            // upstream, but the transaction is out regardless.
            warn!(
                expected = %tx.compute_txid(),
                got = txid,
                "provider echoed unexpected txid after broadcast"
            );
        }

        Ok(TransferOutcome::submitted(tx.compute_txid().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid_byte: u8, value: u64, confirmed: bool) -> Utxo {
        let raw = format!(
            "{{\"txid\": \"{}\", \"vout\": 0, \"value\": {value}, \"status\": {{\"confirmed\": {confirmed}}}}}",
            format!("{txid_byte:02x}").repeat(32)
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn rejects_when_inputs_cannot_cover_amount_plus_fee() {
        let utxos = vec![utxo(1, 60_000, true), utxo(2, 30_000, true)];
        let err = plan_transaction(utxos, 95_000, 10.0).unwrap_err();
        match err {
            TransferError::InsufficientBalance {
                required,
                available,
                ..
            } => {
                assert_eq!(available, "90000");
                assert!(required.parse::<u64>().unwrap() > 95_000);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
    }

    #[test]
    fn never_emits_sub_dust_change() {
        // One input worth amount + fee + something below dust
        let fee = fee_for(1, 3, 10.0);
        let utxos = vec![utxo(1, 100_000 + fee + DUST_LIMIT_SATS - 1, true)];
        let plan = plan_transaction(utxos, 100_000, 10.0).unwrap();
        assert_eq!(plan.change_sats, 0);
        // remainder absorbed into the fee
        assert_eq!(plan.fee_sats, fee + DUST_LIMIT_SATS - 1);
    }

    #[test]
    fn emits_change_at_or_above_dust() {
        let fee = fee_for(1, 3, 10.0);
        let utxos = vec![utxo(1, 100_000 + fee + DUST_LIMIT_SATS, true)];
        let plan = plan_transaction(utxos, 100_000, 10.0).unwrap();
        assert_eq!(plan.change_sats, DUST_LIMIT_SATS);
        assert_eq!(plan.fee_sats, fee);
    }

    #[test]
    fn selects_largest_utxos_first() {
        let utxos = vec![
            utxo(1, 10_000, true),
            utxo(2, 500_000, true),
            utxo(3, 50_000, true),
        ];
        let plan = plan_transaction(utxos, 100_000, 5.0).unwrap();
        assert_eq!(plan.selected.len(), 1);
        assert_eq!(plan.selected[0].value, 500_000);
    }

    #[test]
    fn accumulates_multiple_inputs_when_needed() {
        let utxos = vec![
            utxo(1, 60_000, true),
            utxo(2, 50_000, true),
            utxo(3, 40_000, true),
        ];
        let plan = plan_transaction(utxos, 100_000, 2.0).unwrap();
        assert_eq!(plan.selected.len(), 2);
        let total: u64 = plan.selected.iter().map(|u| u.value).sum();
        assert!(total >= 100_000 + plan.fee_sats);
    }

    #[test]
    fn fee_scales_with_input_count() {
        let one_input = fee_for(1, 3, 10.0);
        let two_inputs = fee_for(2, 3, 10.0);
        assert!(two_inputs > one_input);
        // ceil(vbytes * rate) is never zero at a positive rate
        assert!(fee_for(1, 2, 0.1) > 0);
    }

    #[test]
    fn op_return_script_carries_32_byte_digest() {
        let digest = trade_correlation_digest("0xabc");
        let script = op_return_script(&digest);
        let bytes = script.to_bytes();
        // OP_RETURN (0x6a) OP_PUSHBYTES_32 (0x20) + 32 bytes
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[2..], &digest);
    }

    #[test]
    fn builds_signed_transaction_with_recipient_change_and_op_return() {
        use bitcoin::Network;

        // Well-known compressed-key WIF from the Bitcoin wiki test vectors.
        const WIF: &str = "L1aW4aubDFB7yfras2S1mN3bqg9nwySY8nkoLmJebSLD5BWv3ENZ";
        let keys = TaprootKeys::from_wif(WIF, Network::Bitcoin).unwrap();
        let recipient = keys.address.clone();

        let client = Arc::new(
            resilient_providers::BitcoinDataClient::new(
                &["http://localhost:3000".to_string()],
                resilient_providers::RetryPolicy::default(),
            )
            .unwrap(),
        );
        let strategy = BitcoinTransferStrategy::new(
            keys,
            client,
            Arc::new(crate::notify::LogNotifier),
            BtcEngineConfig::default(),
        );

        let amount = 100_000u64;
        let plan = plan_transaction(vec![utxo(7, 200_000, true)], amount, 10.0).unwrap();
        assert!(plan.change_sats >= DUST_LIMIT_SATS);

        let tx = strategy
            .build_and_sign(&plan, &recipient, amount, "0xabc")
            .unwrap();

        // recipient + change + OP_RETURN, in that order
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value.to_sat(), amount);
        assert_eq!(tx.output[0].script_pubkey, recipient.script_pubkey());
        assert_eq!(tx.output[1].value.to_sat(), plan.change_sats);
        assert_eq!(
            tx.output[1].script_pubkey,
            strategy.keys.script_pubkey()
        );
        assert!(tx.output[2].script_pubkey.is_op_return());
        assert_eq!(tx.output[2].value.to_sat(), 0);

        // every input carries a 64-byte key-path schnorr signature
        assert_eq!(tx.input.len(), 1);
        for input in &tx.input {
            assert_eq!(input.witness.len(), 1);
            assert_eq!(input.witness.iter().next().unwrap().len(), 64);
        }
    }

    #[test]
    fn correlation_digest_is_deterministic() {
        assert_eq!(
            trade_correlation_digest("0xabc"),
            trade_correlation_digest("0xabc")
        );
        assert_ne!(
            trade_correlation_digest("0xabc"),
            trade_correlation_digest("0xabd")
        );
    }
}
