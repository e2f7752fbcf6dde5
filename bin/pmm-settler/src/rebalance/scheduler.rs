//! Scheduled loops around the rebalance state machine: the idle-BTC scanner
//! that opens new records, and the aggregator status poller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use resilient_providers::BitcoinDataClient;
use settler_models::{
    QueueName, RebalanceQuoteJob, RebalancingRecord, RebalancingStatus,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notify::Notifier;
use crate::queue::{EnqueueOpts, JobQueue};
use crate::store::RebalancingStore;

use super::RebalancingOrchestrator;

/// Conservative reserve for the eventual vault deposit: two inputs, two
/// outputs worth of vbytes.
const FEE_RESERVE_VBYTES: f64 = 212.0;

#[derive(Debug, Clone)]
pub struct IdleScannerConfig {
    /// Idle balance below this is left alone.
    pub min_idle_sats: u64,
    pub scan_interval: Duration,
    /// Measured against `trade_completed_at`; records still retrying past it
    /// are parked as Stuck.
    pub max_retry_window: chrono::Duration,
}

/// Statuses the scanner still owns (pre-deposit).
const RETRYABLE: [RebalancingStatus; 3] = [
    RebalancingStatus::Pending,
    RebalancingStatus::QuoteRequested,
    RebalancingStatus::QuoteAccepted,
];

fn is_stuck(record: &RebalancingRecord, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    now - record.trade_completed_at > window
}

fn should_open_rebalance(has_active_record: bool, idle_sats: u64, min_idle_sats: u64) -> bool {
    !has_active_record && idle_sats >= min_idle_sats
}

fn new_idle_record(idle_sats: u64, fee_reserve: u64) -> RebalancingRecord {
    let now = Utc::now();
    let rebalancing_id = format!("0x{}", Uuid::new_v4().simple());
    RebalancingRecord {
        id: now.timestamp_millis() as u64,
        rebalancing_id,
        trade_hash: "idle-balance-scan".to_string(),
        amount: idle_sats,
        real_amount: idle_sats.saturating_sub(fee_reserve),
        status: RebalancingStatus::Pending,
        deposit_address: None,
        oracle_price: None,
        quote_price: None,
        expected_usdc: None,
        actual_usdc: None,
        slippage_bps: None,
        vault_tx_id: None,
        error: None,
        retry_count: 0,
        trade_completed_at: now,
        created_at: now,
        updated_at: now,
    }
}

/// Polls the aggregator for every in-flight record on a fixed cadence.
pub fn spawn_status_poller(
    orchestrator: Arc<RebalancingOrchestrator>,
    interval: Duration,
    join_set: &mut JoinSet<crate::Result<()>>,
) {
    join_set.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "rebalance status poller started");
        loop {
            ticker.tick().await;
            orchestrator.poll_swap_statuses().await;
        }
    });
}

/// Scans the BTC wallet for idle inventory, re-drives retryable records, and
/// parks exhausted ones.
#[allow(clippy::too_many_arguments)]
pub fn spawn_idle_scanner(
    store: Arc<dyn RebalancingStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    bitcoin: Arc<BitcoinDataClient>,
    btc_address: String,
    config: IdleScannerConfig,
    join_set: &mut JoinSet<crate::Result<()>>,
) {
    join_set.spawn(async move {
        let mut ticker = tokio::time::interval(config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = config.scan_interval.as_secs(),
            min_idle_sats = config.min_idle_sats,
            "idle balance scanner started"
        );

        loop {
            ticker.tick().await;
            let now = Utc::now();

            let retryable = match store.list_by_status(&RETRYABLE).await {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "idle scanner could not list records");
                    continue;
                }
            };

            let mut active = false;
            for record in retryable {
                if is_stuck(&record, now, config.max_retry_window) {
                    warn!(
                        rebalancing_id = record.rebalancing_id,
                        retry_count = record.retry_count,
                        "rebalance retry window exhausted, parking as Stuck"
                    );
                    notifier
                        .send_message(&format!(
                            "Rebalance {} is stuck after {} retries (last error: {}). Manual intervention required.",
                            record.rebalancing_id,
                            record.retry_count,
                            record.error.as_deref().unwrap_or("none")
                        ))
                        .await;
                    let mut stuck = record;
                    stuck.status = RebalancingStatus::Stuck;
                    if let Err(e) = store.update(stuck).await {
                        error!(error = %e, "failed to park stuck record");
                    }
                    continue;
                }

                active = true;
                if record.status == RebalancingStatus::Pending {
                    let job = RebalanceQuoteJob {
                        rebalancing_id: record.rebalancing_id.clone(),
                    };
                    let opts = EnqueueOpts::with_job_id(format!(
                        "rebalance-quote-{}-{}",
                        record.rebalancing_id, record.retry_count
                    ));
                    if let Err(e) = queue
                        .enqueue(
                            QueueName::RebalanceQuote,
                            serde_json::to_value(&job).expect("job serializes"),
                            opts,
                        )
                        .await
                    {
                        error!(
                            rebalancing_id = record.rebalancing_id,
                            error = %e,
                            "failed to enqueue quote job"
                        );
                    }
                }
            }

            // In-flight deposits also count as active inventory.
            if !active {
                active = match store
                    .list_by_status(&[
                        RebalancingStatus::DepositSubmitted,
                        RebalancingStatus::SwapProcessing,
                    ])
                    .await
                {
                    Ok(records) => !records.is_empty(),
                    Err(_) => true, // fail safe: do not open a second record blind
                };
            }

            let utxos = match bitcoin.get_address_utxos(&btc_address).await {
                Ok(utxos) => utxos,
                Err(e) => {
                    warn!(error = %e, "idle scanner could not read wallet UTXOs");
                    continue;
                }
            };
            let idle_sats: u64 = utxos
                .iter()
                .filter(|u| u.status.confirmed)
                .map(|u| u.value)
                .sum();
            gauge!("settler_btc_idle_sats").set(idle_sats as f64);

            if !should_open_rebalance(active, idle_sats, config.min_idle_sats) {
                continue;
            }

            let fee_rate = bitcoin.recommended_fee_rate().await;
            let fee_reserve = (FEE_RESERVE_VBYTES * fee_rate).ceil() as u64;
            let record = new_idle_record(idle_sats, fee_reserve);
            let rebalancing_id = record.rebalancing_id.clone();

            info!(
                rebalancing_id,
                idle_sats,
                real_amount = record.real_amount,
                "idle BTC detected, opening rebalance"
            );

            if let Err(e) = store.insert(record).await {
                error!(error = %e, "failed to insert rebalancing record");
                continue;
            }
            let job = RebalanceQuoteJob {
                rebalancing_id: rebalancing_id.clone(),
            };
            let opts =
                EnqueueOpts::with_job_id(format!("rebalance-quote-{rebalancing_id}-0"));
            if let Err(e) = queue
                .enqueue(
                    QueueName::RebalanceQuote,
                    serde_json::to_value(&job).expect("job serializes"),
                    opts,
                )
                .await
            {
                error!(rebalancing_id, error = %e, "failed to enqueue first quote job");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalance::test_fixtures::record;

    #[test]
    fn stuck_detection_uses_trade_completion_time() {
        let mut rec = record("rb1", RebalancingStatus::Pending);
        let window = chrono::Duration::hours(6);

        rec.trade_completed_at = Utc::now() - chrono::Duration::hours(5);
        assert!(!is_stuck(&rec, Utc::now(), window));

        rec.trade_completed_at = Utc::now() - chrono::Duration::hours(7);
        assert!(is_stuck(&rec, Utc::now(), window));
    }

    #[test]
    fn opens_rebalance_only_when_idle_and_no_active_record() {
        assert!(should_open_rebalance(false, 200_000, 100_000));
        assert!(!should_open_rebalance(true, 200_000, 100_000));
        assert!(!should_open_rebalance(false, 99_999, 100_000));
        // boundary: exactly the minimum triggers
        assert!(should_open_rebalance(false, 100_000, 100_000));
    }

    #[test]
    fn idle_record_reserves_fees_from_real_amount() {
        let rec = new_idle_record(500_000, 2_000);
        assert_eq!(rec.amount, 500_000);
        assert_eq!(rec.real_amount, 498_000);
        assert_eq!(rec.status, RebalancingStatus::Pending);
        assert!(rec.rebalancing_id.starts_with("0x"));

        // reserve larger than balance saturates instead of wrapping
        let rec = new_idle_record(1_000, 2_000);
        assert_eq!(rec.real_amount, 0);
    }
}
