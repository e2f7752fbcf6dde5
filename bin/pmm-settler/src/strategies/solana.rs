//! Solana settlement transfers through the settlement program.
//!
//! The program transfers SPL tokens out of the PMM's associated token
//! account and records a payment receipt in a PDA derived from the full
//! payment tuple, so a replayed instruction for the same trade fails at the
//! program level instead of double-paying.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use router_client::RouterClient;
use settler_models::{TransferOutcome, TransferParams};
use sha2::{Digest, Sha256};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::signing::hex_to_b256;
use crate::strategies::{Result, TransferError, TransferStrategy};

const RECEIPT_SEED: &[u8] = b"receipt";
/// Confirmation attempts before the job-level retry machinery takes over.
const MAX_SEND_ATTEMPTS: u32 = 3;

pub struct SolanaTransferStrategy {
    rpc: Arc<RpcClient>,
    payer: Arc<Keypair>,
    program_id: Pubkey,
    /// Owner of the protocol-fee token account.
    fee_vault: Pubkey,
    router: Arc<RouterClient>,
    notifier: Arc<dyn Notifier>,
}

impl SolanaTransferStrategy {
    pub fn new(
        rpc: Arc<RpcClient>,
        payer: Arc<Keypair>,
        program_id: Pubkey,
        fee_vault: Pubkey,
        router: Arc<RouterClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            rpc,
            payer,
            program_id,
            fee_vault,
            router,
            notifier,
        }
    }

    /// Receipt PDA for this exact payment tuple. Any change to trade, payer,
    /// recipient, amount, fee or mint yields a different address.
    fn receipt_pda(
        &self,
        trade_digest: &[u8; 32],
        from: &Pubkey,
        to: &Pubkey,
        amount: u64,
        protocol_fee: u64,
        mint: &Pubkey,
    ) -> Pubkey {
        let amount_le = amount.to_le_bytes();
        let fee_le = protocol_fee.to_le_bytes();
        let (pda, _bump) = Pubkey::find_program_address(
            &[
                RECEIPT_SEED,
                trade_digest,
                from.as_ref(),
                to.as_ref(),
                &amount_le,
                &fee_le,
                mint.as_ref(),
            ],
            &self.program_id,
        );
        pda
    }

    fn payment_instruction(
        &self,
        trade_digest: [u8; 32],
        recipient: Pubkey,
        mint: Pubkey,
        amount: u64,
        protocol_fee: u64,
    ) -> Instruction {
        let payer = self.payer.pubkey();
        let sender_ata = get_associated_token_address(&payer, &mint);
        let recipient_ata = get_associated_token_address(&recipient, &mint);
        let fee_ata = get_associated_token_address(&self.fee_vault, &mint);
        let receipt = self.receipt_pda(
            &trade_digest,
            &payer,
            &recipient,
            amount,
            protocol_fee,
            &mint,
        );

        let mut data = Vec::with_capacity(8 + 32 + 8 + 8);
        data.extend_from_slice(&payment_discriminator());
        data.extend_from_slice(&trade_digest);
        data.extend_from_slice(&amount.to_le_bytes());
        data.extend_from_slice(&protocol_fee.to_le_bytes());

        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(payer, true),
                AccountMeta::new(sender_ata, false),
                AccountMeta::new(recipient_ata, false),
                AccountMeta::new(fee_ata, false),
                AccountMeta::new(receipt, false),
                AccountMeta::new_readonly(mint, false),
                AccountMeta::new_readonly(spl_token::id(), false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data,
        }
    }

    async fn spendable_balance(&self, mint: &Pubkey) -> u64 {
        let sender_ata = get_associated_token_address(&self.payer.pubkey(), mint);
        match self.rpc.get_token_account_balance(&sender_ata).await {
            Ok(balance) => balance.amount.parse::<u64>().unwrap_or(0),
            // A missing token account simply holds nothing.
            Err(_) => 0,
        }
    }
}

fn payment_discriminator() -> [u8; 8] {
    let digest = Sha256::digest(b"global:settle_payment");
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&digest[..8]);
    disc
}

#[async_trait]
impl TransferStrategy for SolanaTransferStrategy {
    async fn transfer(&self, params: &TransferParams) -> Result<TransferOutcome> {
        if params.token.is_native() {
            return Err(TransferError::UnsupportedToken {
                token: params.token.symbol.clone(),
                reason: "solana strategy settles SPL tokens only".to_string(),
            });
        }

        let mint = Pubkey::from_str(&params.token.address).map_err(|e| {
            TransferError::InvalidAddress {
                address: params.token.address.clone(),
                reason: e.to_string(),
            }
        })?;
        let recipient =
            Pubkey::from_str(&params.to_address).map_err(|e| TransferError::InvalidAddress {
                address: params.to_address.clone(),
                reason: e.to_string(),
            })?;

        let amount = params.amount.to::<u64>();
        let available = self.spendable_balance(&mint).await;
        if available < amount {
            self.notifier
                .send_message(&format!(
                    "Insufficient {} balance on Solana: need {amount}, have {available}. Manual top-up required.",
                    params.token.symbol
                ))
                .await;
            return Err(TransferError::InsufficientBalance {
                token: params.token.symbol.clone(),
                required: amount.to_string(),
                available: available.to_string(),
            });
        }

        let fee_details = self
            .router
            .get_fee_details(&params.trade_id)
            .await
            .map_err(|source| TransferError::RouterLookup { source })?;
        let protocol_fee = fee_details.protocol_fee.to::<u64>();

        let trade_digest: [u8; 32] = hex_to_b256(&params.trade_id)
            .map_err(|e| TransferError::InvalidAddress {
                address: params.trade_id.clone(),
                reason: e.to_string(),
            })?
            .0;

        let payer = self.payer.pubkey();
        let instructions = vec![
            // Idempotent creates: no-ops when the accounts already exist.
            create_associated_token_account_idempotent(&payer, &recipient, &mint, &spl_token::id()),
            create_associated_token_account_idempotent(
                &payer,
                &self.fee_vault,
                &mint,
                &spl_token::id(),
            ),
            self.payment_instruction(trade_digest, recipient, mint, amount, protocol_fee),
        ];

        info!(
            trade_id = params.trade_id,
            %recipient,
            amount,
            protocol_fee,
            "executing Solana settlement payment"
        );

        let mut last_error = String::new();
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let blockhash = self
                .rpc
                .get_latest_blockhash()
                .await
                .map_err(|e| TransferError::BroadcastFailed {
                    reason: format!("blockhash fetch failed: {e}"),
                })?;
            let tx = Transaction::new_signed_with_payer(
                &instructions,
                Some(&payer),
                &[self.payer.as_ref()],
                blockhash,
            );

            match self.rpc.send_and_confirm_transaction(&tx).await {
                Ok(signature) => {
                    return Ok(TransferOutcome::submitted(signature.to_string()));
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        trade_id = params.trade_id,
                        attempt,
                        error = last_error,
                        "solana send-and-confirm failed"
                    );
                }
            }
        }

        Err(TransferError::BroadcastFailed {
            reason: format!("confirmation failed after {MAX_SEND_ATTEMPTS} attempts: {last_error}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminator_is_stable() {
        assert_eq!(payment_discriminator(), payment_discriminator());
        assert_ne!(payment_discriminator(), [0u8; 8]);
    }

    #[test]
    fn receipt_pda_changes_with_every_tuple_field() {
        let program_id = Pubkey::new_unique();
        let strategy_fields = |digest: [u8; 32], from, to, amount, fee, mint: Pubkey| {
            let amount_le = u64::to_le_bytes(amount);
            let fee_le = u64::to_le_bytes(fee);
            Pubkey::find_program_address(
                &[
                    RECEIPT_SEED,
                    &digest,
                    Pubkey::as_ref(&from),
                    Pubkey::as_ref(&to),
                    &amount_le,
                    &fee_le,
                    mint.as_ref(),
                ],
                &program_id,
            )
            .0
        };

        let from = Pubkey::new_unique();
        let to = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let base = strategy_fields([1u8; 32], from, to, 100, 1, mint);

        assert_ne!(base, strategy_fields([2u8; 32], from, to, 100, 1, mint));
        assert_ne!(base, strategy_fields([1u8; 32], from, to, 101, 1, mint));
        assert_ne!(base, strategy_fields([1u8; 32], from, to, 100, 2, mint));
        assert_ne!(
            base,
            strategy_fields([1u8; 32], from, to, 100, 1, Pubkey::new_unique())
        );
        // identical tuple is deterministic
        assert_eq!(base, strategy_fields([1u8; 32], from, to, 100, 1, mint));
    }
}
