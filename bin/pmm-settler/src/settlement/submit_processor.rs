//! Submit-stage consumer: sign the make-payment proof and deliver it to the
//! solver. There is no in-handler retry here; a failed submission escalates
//! and the queue's own redelivery policy decides what happens next.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use router_client::SubmitSettlementRequest;
use settler_models::{QueueName, SubmitSettlementEvent, TradeStatus};
use tracing::{info, warn};

use crate::queue::{JobHandler, StageOutcome};
use crate::settlement::RouterApi;
use crate::signing::SettlementSigner;
use crate::store::TradeStore;

pub struct SubmitProcessor {
    pmm_id: String,
    router: Arc<dyn RouterApi>,
    store: Arc<dyn TradeStore>,
    signer: Arc<SettlementSigner>,
}

impl SubmitProcessor {
    pub fn new(
        pmm_id: &str,
        router: Arc<dyn RouterApi>,
        store: Arc<dyn TradeStore>,
        signer: Arc<SettlementSigner>,
    ) -> Self {
        Self {
            pmm_id: pmm_id.to_string(),
            router,
            store,
            signer,
        }
    }

    async fn process(&self, event: SubmitSettlementEvent) -> StageOutcome {
        let signed_at = Utc::now().timestamp();
        let trade_ids = vec![event.trade_id.clone()];

        let signature = match self.signer.sign_make_payment(
            &trade_ids,
            signed_at,
            0,
            &event.payment_tx_id,
        ) {
            Ok(signature) => signature,
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("make-payment signing failed for {}: {e}", event.trade_id),
                };
            }
        };

        let payload = SubmitSettlementRequest {
            trade_ids,
            pmm_id: self.pmm_id.clone(),
            settlement_tx: event.payment_tx_id.clone(),
            signature,
            start_index: 0,
            signed_at,
        };

        if let Err(e) = self.router.submit_settlement_tx(&payload).await {
            // Fatal to this job by design; the queue's redelivery policy owns
            // any further attempts.
            return StageOutcome::Fatal {
                reason: format!("settlement submission failed for {}: {e}", event.trade_id),
            };
        }

        counter!("settler_settlements_submitted").increment(1);
        info!(
            trade_id = event.trade_id,
            payment_tx_id = event.payment_tx_id,
            "settlement proof submitted"
        );

        // Successful submission is the terminal success state.
        match self
            .store
            .set_status_if(&event.trade_id, TradeStatus::Settling, TradeStatus::Completed)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    trade_id = event.trade_id,
                    "trade was not in Settling at submission time"
                );
            }
            Err(e) => {
                warn!(trade_id = event.trade_id, error = %e, "failed to mark trade Completed");
            }
        }

        StageOutcome::Done
    }
}

#[async_trait]
impl JobHandler for SubmitProcessor {
    fn queue(&self) -> QueueName {
        QueueName::SubmitSettlement
    }

    async fn handle(&self, payload: serde_json::Value) -> StageOutcome {
        let event: SubmitSettlementEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                return StageOutcome::Fatal {
                    reason: format!("malformed submit event payload: {e}"),
                };
            }
        };
        self.process(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::test_fixtures::{test_signer, MockRouter};
    use crate::store::{test_fixtures::trade, MemoryTradeStore};

    const PMM_ID: &str = "0x01";

    fn submit_event() -> SubmitSettlementEvent {
        SubmitSettlementEvent {
            trade_id: "0xabc".to_string(),
            payment_tx_id: "0xdeadbeef".to_string(),
        }
    }

    #[tokio::test]
    async fn submits_signed_proof_and_completes_trade() {
        let router = Arc::new(MockRouter::new());
        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Settling))
            .await
            .unwrap();

        let processor = SubmitProcessor::new(PMM_ID, router.clone(), store.clone(), test_signer());
        let outcome = processor.process(submit_event()).await;
        assert!(matches!(outcome, StageOutcome::Done));

        let submitted = router.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].trade_ids, vec!["0xabc".to_string()]);
        assert_eq!(submitted[0].pmm_id, PMM_ID);
        assert_eq!(submitted[0].settlement_tx, "0xdeadbeef");
        assert_eq!(submitted[0].start_index, 0);
        assert!(submitted[0].signature.starts_with("0x"));

        let stored = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Completed);
    }

    #[tokio::test]
    async fn solver_rejection_is_fatal_and_leaves_status() {
        let router = Arc::new(MockRouter::new());
        *router.fail_submit.lock().unwrap() = true;
        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Settling))
            .await
            .unwrap();

        let processor = SubmitProcessor::new(PMM_ID, router, store.clone(), test_signer());
        let outcome = processor.process(submit_event()).await;
        assert!(matches!(outcome, StageOutcome::Fatal { .. }));

        let stored = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Settling);
    }
}
