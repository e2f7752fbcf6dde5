//! Transfer-stage consumer: one instance per destination chain family.
//!
//! Every delivery re-validates ownership, liveness and status before any
//! money moves, so redelivered or stale jobs fall out as `Skip` instead of
//! double-paying. Transient transfer failures retry in place at a fixed
//! delay up to a hard bound; exhaustion and permanent failures escalate as
//! `Fatal` for operator intervention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use settler_models::{
    QueueName, SubmitSettlementEvent, TradeStatus, TransferParams, TransferSettlementEvent,
};
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::queue::{EnqueueOpts, JobHandler, JobQueue, StageOutcome};
use crate::settlement::RouterApi;
use crate::store::TradeStore;
use crate::strategies::TransferStrategyFactory;

pub const MAX_RETRIES: u32 = 60;
pub const RETRY_DELAY: Duration = Duration::from_millis(60_000);

pub struct TransferProcessor {
    queue_name: QueueName,
    pmm_id: String,
    router: Arc<dyn RouterApi>,
    store: Arc<dyn TradeStore>,
    factory: Arc<TransferStrategyFactory>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
}

impl TransferProcessor {
    pub fn new(
        queue_name: QueueName,
        pmm_id: &str,
        router: Arc<dyn RouterApi>,
        store: Arc<dyn TradeStore>,
        factory: Arc<TransferStrategyFactory>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue_name,
            pmm_id: pmm_id.to_string(),
            router,
            store,
            factory,
            queue,
            notifier,
        }
    }

    fn retry_or_exhaust(&self, event: TransferSettlementEvent, reason: String) -> StageOutcome {
        if event.retry_count < MAX_RETRIES {
            let next = TransferSettlementEvent {
                trade_id: event.trade_id,
                retry_count: event.retry_count + 1,
            };
            counter!("settler_transfer_retries").increment(1);
            StageOutcome::Retry {
                payload: serde_json::to_value(&next).expect("event serializes"),
                delay: RETRY_DELAY,
            }
        } else {
            StageOutcome::Fatal {
                reason: format!(
                    "transfer for trade {} exhausted {MAX_RETRIES} retries: {reason}",
                    event.trade_id
                ),
            }
        }
    }

    async fn process(&self, event: TransferSettlementEvent) -> StageOutcome {
        let trade_id = event.trade_id.clone();

        // 1. Ownership: the router may have selected another PMM, or nobody.
        let selection = match self.router.get_pmm_selection(&trade_id).await {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                return StageOutcome::Skip {
                    reason: format!("no selection recorded for trade {trade_id}"),
                };
            }
            Err(e) => return self.retry_or_exhaust(event, format!("selection lookup: {e}")),
        };
        if selection.selected_pmm_id != self.pmm_id {
            // Expected in a multi-PMM deployment; not an error.
            return StageOutcome::Skip {
                reason: format!("trade {trade_id} belongs to PMM {}", selection.selected_pmm_id),
            };
        }

        // 2. Liveness: both the router's view and our own row must exist.
        let router_trade = match self.router.get_trade_data(&trade_id).await {
            Ok(t) => t,
            Err(e) => return self.retry_or_exhaust(event, format!("trade lookup: {e}")),
        };
        let trade = match self.store.get(&trade_id).await {
            Ok(Some(trade)) => trade,
            Ok(None) => {
                // Data-consistency bug upstream; retrying cannot repair it.
                return StageOutcome::Fatal {
                    reason: format!("trade {trade_id} missing from local store"),
                };
            }
            Err(e) => return self.retry_or_exhaust(event, format!("store read: {e}")),
        };

        // Status gate: only a trade we moved into Settling gets a transfer.
        // A redelivery after completion (or after a rollback) lands here.
        if trade.status != TradeStatus::Settling {
            return StageOutcome::Skip {
                reason: format!(
                    "trade {trade_id} is {:?}, transfer stage expects Settling",
                    trade.status
                ),
            };
        }

        // 3. Deadline: an expired trade is abandoned, retrying cannot help.
        let now = Utc::now().timestamp();
        if router_trade.trade_deadline < now {
            error!(
                trade_id,
                deadline = router_trade.trade_deadline,
                "trade deadline passed, abandoning transfer"
            );
            return StageOutcome::Skip {
                reason: format!("trade {trade_id} deadline expired"),
            };
        }

        // 4-5. Destination decode and token/strategy resolution.
        let destination = match router_trade.to_chain.decode() {
            Ok(d) => d,
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("trade {trade_id} has malformed to-chain tuple: {e}"),
                };
            }
        };
        let token = match self
            .router
            .get_token(&destination.network_id, &destination.token_address)
            .await
        {
            Ok(token) => token,
            Err(e) => return self.retry_or_exhaust(event, format!("token lookup: {e}")),
        };
        let strategy = match self
            .factory
            .get_strategy(token.network_type, trade.trade_type)
        {
            Ok(strategy) => strategy,
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("no strategy for trade {trade_id}: {e}"),
                };
            }
        };

        // 6. Execute and hand off to the submit stage.
        let params = TransferParams {
            to_address: destination.recipient,
            amount: router_trade.amount_out,
            token,
            trade_id: trade_id.clone(),
        };

        match strategy.transfer(&params).await {
            Ok(outcome) => {
                let payment_tx_id = outcome.settlement_tx_id();
                info!(trade_id, payment_tx_id, "transfer executed");
                counter!("settler_transfers_executed").increment(1);

                let submit = SubmitSettlementEvent {
                    trade_id: trade_id.clone(),
                    payment_tx_id,
                };
                match self
                    .queue
                    .enqueue(
                        QueueName::SubmitSettlement,
                        serde_json::to_value(&submit).expect("event serializes"),
                        EnqueueOpts::default(),
                    )
                    .await
                {
                    Ok(()) => StageOutcome::Done,
                    // The transfer is already on chain; only the hand-off is
                    // retried, and the submit processor is idempotent on the
                    // solver side.
                    Err(e) => self.retry_or_exhaust(event, format!("submit enqueue: {e}")),
                }
            }
            Err(e) if e.is_permanent() => {
                // Balance/config problems were already notified by the
                // strategy; stop the pipeline for this trade.
                StageOutcome::Fatal {
                    reason: format!("transfer for trade {trade_id} failed permanently: {e}"),
                }
            }
            Err(e) => {
                warn!(trade_id, retry_count = event.retry_count, error = %e, "transfer failed, will retry");
                if event.retry_count + 1 == MAX_RETRIES {
                    self.notifier
                        .send_message(&format!(
                            "Transfer for trade {trade_id} is one retry away from exhaustion: {e}"
                        ))
                        .await;
                }
                if let Err(store_err) = self
                    .store
                    .set_retry_count(&trade_id, event.retry_count + 1)
                    .await
                {
                    warn!(trade_id, error = %store_err, "failed to persist retry count");
                }
                self.retry_or_exhaust(event, e.to_string())
            }
        }
    }
}

#[async_trait]
impl JobHandler for TransferProcessor {
    fn queue(&self) -> QueueName {
        self.queue_name
    }

    async fn handle(&self, payload: serde_json::Value) -> StageOutcome {
        let event: TransferSettlementEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("malformed transfer event payload: {e}"),
                };
            }
        };
        self.process(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::test_fixtures::RecordingNotifier;
    use crate::settlement::test_fixtures::{router_trade, MockRouter, RecordingQueue};
    use crate::store::{test_fixtures::trade, MemoryTradeStore};
    use crate::strategies::test_fixtures::MockStrategy;
    use crate::strategies::TransferStrategyFactory;
    use router_client::PmmSelection;
    use settler_models::NetworkType;

    const PMM_ID: &str = "0x01";

    struct Harness {
        router: Arc<MockRouter>,
        store: Arc<MemoryTradeStore>,
        queue: Arc<RecordingQueue>,
        notifier: Arc<RecordingNotifier>,
        strategy: Arc<MockStrategy>,
        processor: TransferProcessor,
    }

    fn harness(strategy: MockStrategy) -> Harness {
        let router = Arc::new(MockRouter::new());
        let store = Arc::new(MemoryTradeStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let strategy = Arc::new(strategy);

        let mut factory = TransferStrategyFactory::new();
        factory.register_all_trade_types(NetworkType::Evm, strategy.clone());
        factory.register_all_trade_types(NetworkType::Btc, strategy.clone());

        let processor = TransferProcessor::new(
            QueueName::TransferEvm,
            PMM_ID,
            router.clone(),
            store.clone(),
            Arc::new(factory),
            queue.clone(),
            notifier.clone(),
        );

        Harness {
            router,
            store,
            queue,
            notifier,
            strategy,
            processor,
        }
    }

    fn select_for(router: &MockRouter, trade_id: &str, pmm: &str) {
        *router.selection.lock().unwrap() = Some(PmmSelection {
            trade_id: trade_id.to_string(),
            selected_pmm_id: pmm.to_string(),
        });
    }

    fn event(trade_id: &str, retry_count: u32) -> TransferSettlementEvent {
        TransferSettlementEvent {
            trade_id: trade_id.to_string(),
            retry_count,
        }
    }

    async fn ready_harness(strategy: MockStrategy) -> Harness {
        let h = harness(strategy);
        select_for(&h.router, "0xabc", PMM_ID);
        *h.router.trade.lock().unwrap() = Some(router_trade("0xabc", 1800));
        h.store
            .upsert(trade("0xabc", TradeStatus::Settling))
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn successful_transfer_enqueues_submit_event() {
        let h = ready_harness(MockStrategy::succeeding("0xdeadbeef")).await;

        let outcome = h.processor.process(event("0xabc", 0)).await;
        assert!(matches!(outcome, StageOutcome::Done));
        assert_eq!(h.strategy.call_count(), 1);

        let enqueued = h.queue.enqueued.lock().unwrap().clone();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].0, QueueName::SubmitSettlement);
        assert_eq!(enqueued[0].1["trade_id"], "0xabc");
        assert_eq!(enqueued[0].1["payment_tx_id"], "0xdeadbeef");
    }

    #[tokio::test]
    async fn skips_trade_selected_for_another_pmm() {
        let h = ready_harness(MockStrategy::succeeding("0x1")).await;
        select_for(&h.router, "0xabc", "0x99");

        let outcome = h.processor.process(event("0xabc", 0)).await;
        assert!(matches!(outcome, StageOutcome::Skip { .. }));
        assert_eq!(h.strategy.call_count(), 0);
    }

    #[tokio::test]
    async fn replay_after_completion_does_not_transfer_again() {
        let h = ready_harness(MockStrategy::succeeding("0x1")).await;
        h.store
            .set_status("0xabc", TradeStatus::Completed)
            .await
            .unwrap();

        let outcome = h.processor.process(event("0xabc", 0)).await;
        assert!(matches!(outcome, StageOutcome::Skip { .. }));
        assert_eq!(h.strategy.call_count(), 0);
        assert!(h.queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_deadline_aborts_without_calling_strategy() {
        let h = ready_harness(MockStrategy::succeeding("0x1")).await;
        *h.router.trade.lock().unwrap() = Some(router_trade("0xabc", -10));

        let outcome = h.processor.process(event("0xabc", 0)).await;
        match outcome {
            StageOutcome::Skip { reason } => assert!(reason.contains("deadline")),
            other => panic!("expected Skip, got {other:?}"),
        }
        assert_eq!(h.strategy.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_local_trade_is_fatal() {
        let h = harness(MockStrategy::succeeding("0x1"));
        select_for(&h.router, "0xabc", PMM_ID);
        *h.router.trade.lock().unwrap() = Some(router_trade("0xabc", 1800));

        let outcome = h.processor.process(event("0xabc", 0)).await;
        assert!(matches!(outcome, StageOutcome::Fatal { .. }));
        assert_eq!(h.strategy.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_retries_with_incremented_count_and_fixed_delay() {
        let h = ready_harness(MockStrategy::failing_transient()).await;

        let outcome = h.processor.process(event("0xabc", 0)).await;
        match outcome {
            StageOutcome::Retry { payload, delay } => {
                assert_eq!(delay, RETRY_DELAY);
                assert_eq!(payload["retry_count"], 1);
                assert_eq!(payload["trade_id"], "0xabc");
            }
            other => panic!("expected Retry, got {other:?}"),
        }
        assert_eq!(h.strategy.call_count(), 1);
    }

    #[tokio::test]
    async fn last_allowed_retry_still_retries_then_exhausts() {
        let h = ready_harness(MockStrategy::failing_transient()).await;

        // retry_count = MAX_RETRIES - 1 still produces one more attempt
        let outcome = h.processor.process(event("0xabc", MAX_RETRIES - 1)).await;
        assert!(matches!(outcome, StageOutcome::Retry { .. }));

        // retry_count = MAX_RETRIES escalates
        let outcome = h.processor.process(event("0xabc", MAX_RETRIES)).await;
        match outcome {
            StageOutcome::Fatal { reason } => assert!(reason.contains("exhausted")),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_fatal_without_retry() {
        let strategy = MockStrategy {
            calls: std::sync::Mutex::new(Vec::new()),
            result: Box::new(|| {
                Err(crate::strategies::TransferError::InsufficientBalance {
                    token: "USDC".to_string(),
                    required: "100".to_string(),
                    available: "1".to_string(),
                })
            }),
        };
        let h = ready_harness(strategy).await;

        let outcome = h.processor.process(event("0xabc", 0)).await;
        assert!(matches!(outcome, StageOutcome::Fatal { .. }));
    }

    #[tokio::test]
    async fn operator_notified_on_final_retry() {
        let h = ready_harness(MockStrategy::failing_transient()).await;
        let outcome = h.processor.process(event("0xabc", MAX_RETRIES - 1)).await;
        assert!(matches!(outcome, StageOutcome::Retry { .. }));
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("0xabc"));
    }
}
