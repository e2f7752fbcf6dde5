//! Inventory rebalancing: idle BTC → aggregator swap → working capital.
//!
//! Three asynchronous stages over one record: a quote stage that prices the
//! idle inventory and gates on slippage against an independent oracle, a
//! transfer stage that deposits the BTC into the aggregator's vault, and a
//! poll loop that tracks the aggregator's side until the swap terminates.
//! Failures roll the record back to a retryable predecessor; the scheduler
//! parks records as Stuck once the retry window against the source trade's
//! completion time is spent.

mod scheduler;

pub use scheduler::{spawn_idle_scanner, spawn_status_poller, IdleScannerConfig};

use std::sync::Arc;
use std::time::Duration;

use aggregator_client::{
    AggregatorClient, AggregatorSwapStatus, RebalanceQuote, RebalanceQuoteRequest,
};
use async_trait::async_trait;
use metrics::counter;
use settler_models::{
    slippage_bps, NetworkType, QueueName, RebalanceQuoteJob, RebalanceTransferJob,
    RebalancingRecord, RebalancingStatus, Token, TransferParams,
};
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::queue::{EnqueueOpts, JobHandler, JobQueue, StageOutcome};
use crate::store::RebalancingStore;
use crate::strategies::TransferStrategy;

/// Delay before re-attempting a failed vault deposit.
const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Aggregator surface consumed by the rebalance stages; concrete calls go
/// through `AggregatorClient`.
#[async_trait]
pub trait AggregatorApi: Send + Sync {
    async fn request_quote(
        &self,
        request: &RebalanceQuoteRequest,
    ) -> aggregator_client::Result<RebalanceQuote>;
    async fn submit_deposit(&self, deposit_address: &str, tx_id: &str)
        -> aggregator_client::Result<()>;
    async fn get_status(
        &self,
        deposit_address: &str,
    ) -> aggregator_client::Result<AggregatorSwapStatus>;
}

#[async_trait]
impl AggregatorApi for AggregatorClient {
    async fn request_quote(
        &self,
        request: &RebalanceQuoteRequest,
    ) -> aggregator_client::Result<RebalanceQuote> {
        AggregatorClient::request_quote(self, request).await
    }

    async fn submit_deposit(
        &self,
        deposit_address: &str,
        tx_id: &str,
    ) -> aggregator_client::Result<()> {
        AggregatorClient::submit_deposit(self, deposit_address, tx_id).await
    }

    async fn get_status(
        &self,
        deposit_address: &str,
    ) -> aggregator_client::Result<AggregatorSwapStatus> {
        AggregatorClient::get_status(self, deposit_address).await
    }
}

/// Price oracle surface; concrete calls go through
/// `resilient_providers::PriceClient`.
#[async_trait]
pub trait PriceApi: Send + Sync {
    async fn get_usd_price(&self, symbol: &str) -> Result<f64, String>;
}

#[async_trait]
impl PriceApi for resilient_providers::PriceClient {
    async fn get_usd_price(&self, symbol: &str) -> Result<f64, String> {
        resilient_providers::PriceClient::get_usd_price(self, symbol)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Accept a quote iff `|quote - oracle| / oracle` in bps is at most this.
    pub slippage_threshold_bps: u64,
    /// Our own BTC address, handed to the aggregator as the refund target.
    pub refund_address: String,
    /// Final recipient of the swapped asset (the liquidation vault).
    pub vault_recipient: String,
    /// Target asset symbol for the swap.
    pub to_asset: String,
}

/// The native-BTC token descriptor the transfer stage settles with.
pub fn btc_native_token() -> Token {
    Token {
        token_id: "btc-native".to_string(),
        network_id: "BTC".to_string(),
        network_type: NetworkType::Btc,
        address: Token::NATIVE.to_string(),
        symbol: "BTC".to_string(),
        decimals: 8,
    }
}

pub struct RebalancingOrchestrator {
    store: Arc<dyn RebalancingStore>,
    aggregator: Arc<dyn AggregatorApi>,
    price: Arc<dyn PriceApi>,
    btc_strategy: Arc<dyn TransferStrategy>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    config: RebalanceConfig,
}

impl RebalancingOrchestrator {
    pub fn new(
        store: Arc<dyn RebalancingStore>,
        aggregator: Arc<dyn AggregatorApi>,
        price: Arc<dyn PriceApi>,
        btc_strategy: Arc<dyn TransferStrategy>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            price,
            btc_strategy,
            queue,
            notifier,
            config,
        }
    }

    /// Roll the record back to `Pending` with an error annotation; the
    /// scheduler will pick it up again.
    async fn rollback_to_pending(&self, mut record: RebalancingRecord, error: String) {
        record.status = RebalancingStatus::Pending;
        record.error = Some(error);
        record.retry_count += 1;
        if let Err(e) = self.store.update(record).await {
            error!(error = %e, "failed to roll rebalancing record back to Pending");
        }
    }

    /// Quote stage: price the idle inventory, gate on slippage, hand off to
    /// the transfer stage.
    pub async fn process_quote(&self, job: RebalanceQuoteJob) -> StageOutcome {
        let rebalancing_id = job.rebalancing_id.clone();
        let record = match self.store.get(&rebalancing_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return StageOutcome::Fatal {
                    reason: format!("rebalancing record {rebalancing_id} not found"),
                };
            }
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("store read failed for {rebalancing_id}: {e}"),
                };
            }
        };

        // Stale or duplicate job: only a Pending record gets quoted.
        match self
            .store
            .set_status_if(
                &rebalancing_id,
                RebalancingStatus::Pending,
                RebalancingStatus::QuoteRequested,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return StageOutcome::Skip {
                    reason: format!(
                        "record {rebalancing_id} is {:?}, quote stage expects Pending",
                        record.status
                    ),
                };
            }
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("status swap failed for {rebalancing_id}: {e}"),
                };
            }
        }
        let mut record = RebalancingRecord {
            status: RebalancingStatus::QuoteRequested,
            ..record
        };

        let oracle_price = match self.price.get_usd_price("BTC").await {
            Ok(price) => price,
            Err(e) => {
                warn!(rebalancing_id, error = e, "oracle price unavailable, will retry later");
                self.rollback_to_pending(record, format!("oracle price unavailable: {e}"))
                    .await;
                return StageOutcome::Skip {
                    reason: format!("oracle price unavailable for {rebalancing_id}"),
                };
            }
        };

        let quote_request = RebalanceQuoteRequest {
            amount_sats: record.real_amount,
            from_asset: "BTC".to_string(),
            to_asset: self.config.to_asset.clone(),
            refund_address: self.config.refund_address.clone(),
            recipient: self.config.vault_recipient.clone(),
        };
        let quote = match self.aggregator.request_quote(&quote_request).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!(rebalancing_id, error = %e, "aggregator quote failed, will retry later");
                self.rollback_to_pending(record, format!("aggregator quote failed: {e}"))
                    .await;
                return StageOutcome::Skip {
                    reason: format!("aggregator quote failed for {rebalancing_id}"),
                };
            }
        };

        let bps = slippage_bps(oracle_price, quote.quote_price);
        record.oracle_price = Some(oracle_price);
        record.quote_price = Some(quote.quote_price);
        record.expected_usdc = Some(quote.amount_out);
        record.slippage_bps = Some(bps);
        record.deposit_address = Some(quote.deposit_address.clone());

        if bps > self.config.slippage_threshold_bps {
            counter!("settler_rebalance_slippage_rejections").increment(1);
            self.notifier
                .send_message(&format!(
                    "Rebalance {rebalancing_id}: quote slippage {bps} bps exceeds threshold {} bps (oracle {oracle_price}, quote {}). Will retry later.",
                    self.config.slippage_threshold_bps, quote.quote_price
                ))
                .await;
            self.rollback_to_pending(record, format!("slippage {bps} bps over threshold"))
                .await;
            return StageOutcome::Skip {
                reason: format!("slippage {bps} bps over threshold for {rebalancing_id}"),
            };
        }

        record.status = RebalancingStatus::QuoteAccepted;
        record.error = None;
        let retry_count = record.retry_count;
        if let Err(e) = self.store.update(record).await {
            return StageOutcome::Fatal {
                reason: format!("failed to persist accepted quote for {rebalancing_id}: {e}"),
            };
        }

        // The job id embeds the retry count so a later re-quote can enqueue
        // a fresh transfer without colliding with this one's dedup window.
        let transfer_job = RebalanceTransferJob {
            rebalancing_id: rebalancing_id.clone(),
            retry_count,
        };
        let opts = EnqueueOpts::with_job_id(format!(
            "rebalance-transfer-{rebalancing_id}-{retry_count}"
        ));
        if let Err(e) = self
            .queue
            .enqueue(
                QueueName::RebalanceTransfer,
                serde_json::to_value(&transfer_job).expect("job serializes"),
                opts,
            )
            .await
        {
            return StageOutcome::Fatal {
                reason: format!("failed to enqueue transfer for {rebalancing_id}: {e}"),
            };
        }

        info!(
            rebalancing_id,
            oracle_price,
            quote_price = quote.quote_price,
            slippage_bps = bps,
            "rebalance quote accepted"
        );
        StageOutcome::Done
    }

    /// Transfer stage: deposit the BTC into the quoted vault address.
    pub async fn process_transfer(&self, job: RebalanceTransferJob) -> StageOutcome {
        let rebalancing_id = job.rebalancing_id.clone();
        let record = match self.store.get(&rebalancing_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return StageOutcome::Fatal {
                    reason: format!("rebalancing record {rebalancing_id} not found"),
                };
            }
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("store read failed for {rebalancing_id}: {e}"),
                };
            }
        };

        // Only a freshly accepted quote gets a transfer; anything else is a
        // stale or duplicate job.
        if record.status != RebalancingStatus::QuoteAccepted {
            return StageOutcome::Skip {
                reason: format!(
                    "record {rebalancing_id} is {:?}, transfer stage expects QuoteAccepted",
                    record.status
                ),
            };
        }

        let deposit_address = match &record.deposit_address {
            Some(address) => address.clone(),
            None => {
                return StageOutcome::Fatal {
                    reason: format!("record {rebalancing_id} accepted a quote without a deposit address"),
                };
            }
        };

        let params = TransferParams {
            to_address: deposit_address.clone(),
            amount: alloy::primitives::U256::from(record.real_amount),
            token: btc_native_token(),
            trade_id: rebalancing_id.clone(),
        };

        let outcome = match self.btc_strategy.transfer(&params).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_permanent() => {
                return StageOutcome::Fatal {
                    reason: format!("rebalance transfer for {rebalancing_id} failed permanently: {e}"),
                };
            }
            Err(e) => {
                // Status stays QuoteAccepted: only the transfer is retried,
                // not the whole quote.
                warn!(rebalancing_id, error = %e, "vault deposit failed, retrying transfer");
                let next = RebalanceTransferJob {
                    rebalancing_id,
                    retry_count: job.retry_count + 1,
                };
                return StageOutcome::Retry {
                    payload: serde_json::to_value(&next).expect("job serializes"),
                    delay: TRANSFER_RETRY_DELAY,
                };
            }
        };

        let tx_id = outcome.settlement_tx_id();

        // Best effort: the aggregator's own chain monitoring will find the
        // deposit even if this call never lands.
        if let Err(e) = self.aggregator.submit_deposit(&deposit_address, &tx_id).await {
            warn!(rebalancing_id, error = %e, "deposit notification failed (non-fatal)");
        }

        let mut record = record;
        record.vault_tx_id = Some(tx_id.clone());
        record.status = RebalancingStatus::DepositSubmitted;
        record.error = None;
        if let Err(e) = self.store.update(record).await {
            return StageOutcome::Fatal {
                reason: format!("failed to persist deposit for {rebalancing_id}: {e}"),
            };
        }

        counter!("settler_rebalance_deposits").increment(1);
        info!(rebalancing_id, tx_id, "rebalance deposit submitted");
        StageOutcome::Done
    }

    /// Poll pass over every in-flight record; called on a fixed schedule.
    pub async fn poll_swap_statuses(&self) {
        let in_flight = match self
            .store
            .list_by_status(&[
                RebalancingStatus::DepositSubmitted,
                RebalancingStatus::SwapProcessing,
            ])
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "rebalance status poll could not list records");
                return;
            }
        };

        for record in in_flight {
            let deposit_address = match &record.deposit_address {
                Some(address) => address.clone(),
                None => continue,
            };
            let status = match self.aggregator.get_status(&deposit_address).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        rebalancing_id = record.rebalancing_id,
                        error = %e,
                        "aggregator status poll failed"
                    );
                    continue;
                }
            };
            self.apply_swap_status(record, status).await;
        }
    }

    async fn apply_swap_status(&self, mut record: RebalancingRecord, status: AggregatorSwapStatus) {
        let rebalancing_id = record.rebalancing_id.clone();
        match status {
            AggregatorSwapStatus::Success => {
                record.status = RebalancingStatus::Completed;
                record.actual_usdc = record.expected_usdc;
                if let Err(e) = self.store.update(record).await {
                    error!(rebalancing_id, error = %e, "failed to mark rebalance Completed");
                    return;
                }
                counter!("settler_rebalances_completed").increment(1);
                self.notifier
                    .send_message(&format!("Rebalance {rebalancing_id} completed."))
                    .await;
            }
            AggregatorSwapStatus::Failed => {
                warn!(rebalancing_id, "aggregator reports swap failed, restarting from Pending");
                self.notifier
                    .send_message(&format!(
                        "Rebalance {rebalancing_id} failed on the aggregator side; restarting from quote."
                    ))
                    .await;
                self.rollback_to_pending(record, "aggregator reported FAILED".to_string())
                    .await;
            }
            AggregatorSwapStatus::Refunded => {
                // Terminal, and unexpected: our deposit came back.
                error!(rebalancing_id, "aggregator refunded the deposit");
                record.status = RebalancingStatus::Refunded;
                if let Err(e) = self.store.update(record).await {
                    error!(rebalancing_id, error = %e, "failed to mark rebalance Refunded");
                    return;
                }
                self.notifier
                    .send_message(&format!(
                        "Rebalance {rebalancing_id} was REFUNDED by the aggregator; manual review required."
                    ))
                    .await;
            }
            AggregatorSwapStatus::Processing
            | AggregatorSwapStatus::KnownDepositTx
            | AggregatorSwapStatus::PendingDeposit => {
                if record.status == RebalancingStatus::DepositSubmitted {
                    record.status = RebalancingStatus::SwapProcessing;
                    if let Err(e) = self.store.update(record).await {
                        error!(rebalancing_id, error = %e, "failed to advance to SwapProcessing");
                    }
                }
            }
            AggregatorSwapStatus::IncompleteDeposit => {
                warn!(rebalancing_id, "aggregator reports incomplete deposit");
            }
            AggregatorSwapStatus::Unknown(other) => {
                // Defensive default: log and leave the record alone.
                warn!(rebalancing_id, status = other, "unrecognized aggregator status");
            }
        }
    }
}

/// Queue adapter for the quote stage.
pub struct RebalanceQuoteHandler(pub Arc<RebalancingOrchestrator>);

#[async_trait]
impl JobHandler for RebalanceQuoteHandler {
    fn queue(&self) -> QueueName {
        QueueName::RebalanceQuote
    }

    async fn handle(&self, payload: serde_json::Value) -> StageOutcome {
        match serde_json::from_value::<RebalanceQuoteJob>(payload) {
            Ok(job) => self.0.process_quote(job).await,
            Err(e) => StageOutcome::Fatal {
                reason: format!("malformed rebalance quote payload: {e}"),
            },
        }
    }
}

/// Queue adapter for the transfer stage.
pub struct RebalanceTransferHandler(pub Arc<RebalancingOrchestrator>);

#[async_trait]
impl JobHandler for RebalanceTransferHandler {
    fn queue(&self) -> QueueName {
        QueueName::RebalanceTransfer
    }

    async fn handle(&self, payload: serde_json::Value) -> StageOutcome {
        match serde_json::from_value::<RebalanceTransferJob>(payload) {
            Ok(job) => self.0.process_transfer(job).await,
            Err(e) => StageOutcome::Fatal {
                reason: format!("malformed rebalance transfer payload: {e}"),
            },
        }
    }
}
