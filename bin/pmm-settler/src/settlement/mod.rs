//! Settlement state machine: commit → select → transfer → submit.
//!
//! The orchestrator owns the synchronous router-facing operations
//! (`get_settlement_signature`, `ack_settlement`, `signal_payment`); the
//! queue processors in the sibling modules carry a trade through the
//! asynchronous transfer and proof-submission stages.

pub mod submit_processor;
pub mod transfer_processor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use router_client::{
    PmmSelection, PresignEntry, RouterClient, RouterTrade, SubmitSettlementRequest,
};
use settler_models::{
    NetworkType, QueueName, Token, TradeStatus, TransferSettlementEvent,
};
use snafu::Snafu;
use tracing::{info, warn};

use crate::queue::{EnqueueOpts, JobQueue};
use crate::signing::SettlementSigner;
use crate::store::TradeStore;

/// Commitment window offered to the router.
pub const COMMIT_DEADLINE_SECS: i64 = 1800;

/// Router/solver surface the settlement pipeline consumes. Concrete calls go
/// through `RouterClient`; tests substitute their own implementation.
#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn get_pmm_selection(
        &self,
        trade_id: &str,
    ) -> router_client::Result<Option<PmmSelection>>;
    async fn get_trade_data(&self, trade_id: &str) -> router_client::Result<RouterTrade>;
    async fn get_settlement_presigns(
        &self,
        trade_id: &str,
    ) -> router_client::Result<Vec<PresignEntry>>;
    async fn get_token(&self, network_id: &str, address: &str) -> router_client::Result<Token>;
    async fn get_token_by_token_id(&self, token_id: &str) -> router_client::Result<Token>;
    async fn submit_settlement_tx(
        &self,
        payload: &SubmitSettlementRequest,
    ) -> router_client::Result<()>;
}

#[async_trait]
impl RouterApi for RouterClient {
    async fn get_pmm_selection(
        &self,
        trade_id: &str,
    ) -> router_client::Result<Option<PmmSelection>> {
        RouterClient::get_pmm_selection(self, trade_id).await
    }

    async fn get_trade_data(&self, trade_id: &str) -> router_client::Result<RouterTrade> {
        RouterClient::get_trade_data(self, trade_id).await
    }

    async fn get_settlement_presigns(
        &self,
        trade_id: &str,
    ) -> router_client::Result<Vec<PresignEntry>> {
        RouterClient::get_settlement_presigns(self, trade_id).await
    }

    async fn get_token(&self, network_id: &str, address: &str) -> router_client::Result<Token> {
        RouterClient::get_token(self, network_id, address).await
    }

    async fn get_token_by_token_id(&self, token_id: &str) -> router_client::Result<Token> {
        RouterClient::get_token_by_token_id(self, token_id).await
    }

    async fn submit_settlement_tx(
        &self,
        payload: &SubmitSettlementRequest,
    ) -> router_client::Result<()> {
        RouterClient::submit_settlement_tx(self, payload).await
    }
}

#[derive(Debug, Snafu)]
pub enum SettlementError {
    #[snafu(display("Trade {trade_id} not found"))]
    TradeNotFound { trade_id: String },

    #[snafu(display("No presign entry for PMM {pmm_id} on trade {trade_id}"))]
    PresignMissing { trade_id: String, pmm_id: String },

    #[snafu(display(
        "Receiving address mismatch for trade {trade_id}: presign recorded {recorded}, local key derives {derived}"
    ))]
    AddressMismatch {
        trade_id: String,
        recorded: String,
        derived: String,
    },

    #[snafu(display("No receiving address configured for network type {network:?}"))]
    NoRecvAddress { network: NetworkType },

    #[snafu(display("Trade {trade_id} is in {current:?}, expected {expected:?}"))]
    InvalidStatus {
        trade_id: String,
        current: TradeStatus,
        expected: TradeStatus,
    },

    #[snafu(display("Router call failed: {source}"))]
    Router {
        source: router_client::RouterClientError,
    },

    #[snafu(display("Store operation failed: {source}"))]
    Store { source: crate::store::StoreError },

    #[snafu(display("Signing failed: {source}"))]
    Signing { source: crate::signing::SigningError },

    #[snafu(display("Queue push failed: {source}"))]
    Queue { source: crate::queue::QueueError },
}

pub type Result<T, E = SettlementError> = std::result::Result<T, E>;

/// Returned by `get_settlement_signature`.
#[derive(Debug, Clone)]
pub struct CommitmentSignature {
    pub trade_id: String,
    pub signature: String,
    pub deadline: i64,
}

pub struct SettlementOrchestrator {
    pmm_id: String,
    router: Arc<dyn RouterApi>,
    store: Arc<dyn TradeStore>,
    queue: Arc<dyn JobQueue>,
    signer: Arc<SettlementSigner>,
    /// Locally derived receiving address per chain family; the presign
    /// verification compares against these.
    recv_addresses: HashMap<NetworkType, String>,
}

impl SettlementOrchestrator {
    pub fn new(
        pmm_id: &str,
        router: Arc<dyn RouterApi>,
        store: Arc<dyn TradeStore>,
        queue: Arc<dyn JobQueue>,
        signer: Arc<SettlementSigner>,
        recv_addresses: HashMap<NetworkType, String>,
    ) -> Self {
        Self {
            pmm_id: pmm_id.to_string(),
            router,
            store,
            queue,
            signer,
            recv_addresses,
        }
    }

    /// Commit to settling `trade_id`: verify the router's presign binds our
    /// identity to the address our keys actually derive (fail closed on any
    /// mismatch), sign the commitment hash, and record the trade Committed.
    pub async fn get_settlement_signature(&self, trade_id: &str) -> Result<CommitmentSignature> {
        let presigns = self
            .router
            .get_settlement_presigns(trade_id)
            .await
            .map_err(|source| SettlementError::Router { source })?;
        let router_trade = self
            .router
            .get_trade_data(trade_id)
            .await
            .map_err(|source| SettlementError::Router { source })?;

        let presign = presigns
            .iter()
            .find(|p| p.pmm_id == self.pmm_id)
            .ok_or_else(|| SettlementError::PresignMissing {
                trade_id: trade_id.to_string(),
                pmm_id: self.pmm_id.clone(),
            })?;

        let from_chain =
            router_trade
                .from_chain
                .decode()
                .map_err(|source| SettlementError::Router { source })?;
        let from_network = NetworkType::of_network_id(&from_chain.network_id);
        let derived = self
            .recv_addresses
            .get(&from_network)
            .ok_or(SettlementError::NoRecvAddress {
                network: from_network,
            })?;

        if presign.pmm_recv_address != *derived {
            return Err(SettlementError::AddressMismatch {
                trade_id: trade_id.to_string(),
                recorded: presign.pmm_recv_address.clone(),
                derived: derived.clone(),
            });
        }

        let to_chain =
            router_trade
                .to_chain
                .decode()
                .map_err(|source| SettlementError::Router { source })?;
        let deadline = Utc::now().timestamp() + COMMIT_DEADLINE_SECS;

        let signature = self
            .signer
            .sign_commit_info(
                &self.pmm_id,
                &presign.pmm_recv_address,
                &to_chain.network_id,
                &to_chain.token_address,
                router_trade.amount_out,
                deadline,
            )
            .map_err(|source| SettlementError::Signing { source })?;

        self.store
            .set_status(trade_id, TradeStatus::Committed)
            .await
            .map_err(|source| SettlementError::Store { source })?;

        info!(trade_id, deadline, "settlement commitment signed");
        Ok(CommitmentSignature {
            trade_id: trade_id.to_string(),
            signature,
            deadline,
        })
    }

    /// Record the router's selection verdict for a committed trade.
    pub async fn ack_settlement(&self, trade_id: &str, chosen: bool) -> Result<()> {
        let next = if chosen {
            TradeStatus::Selected
        } else {
            TradeStatus::Failed
        };
        let moved = self
            .store
            .set_status_if(trade_id, TradeStatus::Committed, next)
            .await
            .map_err(|source| SettlementError::Store { source })?;
        if !moved {
            // Redelivered ack; the trade already advanced.
            warn!(trade_id, chosen, "settlement ack ignored, trade not in Committed");
            return Ok(());
        }
        if chosen {
            info!(trade_id, "selected for settlement");
        } else {
            info!(trade_id, "not chosen for settlement");
        }
        Ok(())
    }

    /// Kick off the asynchronous transfer stage for a selected trade: move
    /// it to Settling and enqueue the transfer job on the destination
    /// chain's queue. The status swap happens first so a fast worker never
    /// observes a stale status.
    pub async fn signal_payment(&self, trade_id: &str) -> Result<()> {
        let trade = self
            .store
            .get(trade_id)
            .await
            .map_err(|source| SettlementError::Store { source })?
            .ok_or_else(|| SettlementError::TradeNotFound {
                trade_id: trade_id.to_string(),
            })?;

        let token = self
            .router
            .get_token_by_token_id(&trade.to_token_id)
            .await
            .map_err(|source| SettlementError::Router { source })?;
        let queue_name = transfer_queue_for(token.network_type);

        let moved = self
            .store
            .set_status_if(trade_id, TradeStatus::Selected, TradeStatus::Settling)
            .await
            .map_err(|source| SettlementError::Store { source })?;
        if !moved {
            return Err(SettlementError::InvalidStatus {
                trade_id: trade_id.to_string(),
                current: trade.status,
                expected: TradeStatus::Selected,
            });
        }

        let event = TransferSettlementEvent {
            trade_id: trade_id.to_string(),
            retry_count: 0,
        };
        self.queue
            .enqueue(
                queue_name,
                serde_json::to_value(&event).expect("event serializes"),
                EnqueueOpts::default(),
            )
            .await
            .map_err(|source| SettlementError::Queue { source })?;

        info!(trade_id, queue = queue_name.as_str(), "transfer job enqueued");
        Ok(())
    }
}

/// Which transfer queue settles a destination chain family.
pub fn transfer_queue_for(network: NetworkType) -> QueueName {
    match network {
        NetworkType::Evm => QueueName::TransferEvm,
        NetworkType::Btc | NetworkType::Tbtc => QueueName::TransferBtc,
        NetworkType::Solana => QueueName::TransferSolana,
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use alloy::primitives::U256;
    use router_client::EncodedChain;
    use std::sync::Mutex;

    pub fn encoded(network_id: &str, token: &str, address: &str) -> EncodedChain {
        EncodedChain {
            network_id: alloy::hex::encode(network_id),
            token: alloy::hex::encode(token),
            address: alloy::hex::encode(address),
        }
    }

    pub fn router_trade(trade_id: &str, deadline_offset_secs: i64) -> RouterTrade {
        RouterTrade {
            trade_id: trade_id.to_string(),
            from_chain: encoded("BTC", "native", "bc1pexampleaddress"),
            to_chain: encoded(
                "8453",
                "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                "0x1111111111111111111111111111111111111111",
            ),
            amount_out: U256::from(250_000_000u64),
            trade_deadline: Utc::now().timestamp() + deadline_offset_secs,
            script_deadline: Utc::now().timestamp() + deadline_offset_secs + 1800,
        }
    }

    pub fn usdc_token() -> Token {
        Token {
            token_id: "usdc-8453".to_string(),
            network_id: "8453".to_string(),
            network_type: NetworkType::Evm,
            address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string(),
            symbol: "USDC".to_string(),
            decimals: 6,
        }
    }

    /// Scriptable router: every call returns the configured value.
    pub struct MockRouter {
        pub selection: Mutex<Option<PmmSelection>>,
        pub trade: Mutex<Option<RouterTrade>>,
        pub presigns: Mutex<Vec<PresignEntry>>,
        pub token: Mutex<Option<Token>>,
        pub submitted: Mutex<Vec<SubmitSettlementRequest>>,
        pub fail_submit: Mutex<bool>,
    }

    impl MockRouter {
        pub fn new() -> Self {
            Self {
                selection: Mutex::new(None),
                trade: Mutex::new(None),
                presigns: Mutex::new(Vec::new()),
                token: Mutex::new(Some(usdc_token())),
                submitted: Mutex::new(Vec::new()),
                fail_submit: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl RouterApi for MockRouter {
        async fn get_pmm_selection(
            &self,
            _trade_id: &str,
        ) -> router_client::Result<Option<PmmSelection>> {
            Ok(self.selection.lock().unwrap().clone())
        }

        async fn get_trade_data(&self, trade_id: &str) -> router_client::Result<RouterTrade> {
            self.trade.lock().unwrap().clone().ok_or_else(|| {
                router_client::UnexpectedStatusSnafu {
                    status: reqwest::StatusCode::NOT_FOUND,
                    path: format!("v1/trades/{trade_id}"),
                    body: "missing".to_string(),
                }
                .build()
            })
        }

        async fn get_settlement_presigns(
            &self,
            _trade_id: &str,
        ) -> router_client::Result<Vec<PresignEntry>> {
            Ok(self.presigns.lock().unwrap().clone())
        }

        async fn get_token(
            &self,
            _network_id: &str,
            _address: &str,
        ) -> router_client::Result<Token> {
            Ok(self.token.lock().unwrap().clone().expect("token configured"))
        }

        async fn get_token_by_token_id(&self, _token_id: &str) -> router_client::Result<Token> {
            Ok(self.token.lock().unwrap().clone().expect("token configured"))
        }

        async fn submit_settlement_tx(
            &self,
            payload: &SubmitSettlementRequest,
        ) -> router_client::Result<()> {
            if *self.fail_submit.lock().unwrap() {
                return Err(router_client::UnexpectedStatusSnafu {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    path: "v1/settlements".to_string(),
                    body: "solver unavailable".to_string(),
                }
                .build());
            }
            self.submitted.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    /// Queue double that records enqueues instead of running workers.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub enqueued: Mutex<Vec<(QueueName, serde_json::Value, EnqueueOpts)>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            queue: QueueName,
            payload: serde_json::Value,
            opts: EnqueueOpts,
        ) -> crate::queue::Result<()> {
            self.enqueued.lock().unwrap().push((queue, payload, opts));
            Ok(())
        }
    }

    pub fn test_signer() -> Arc<SettlementSigner> {
        use alloy::primitives::Address;
        use alloy::signers::local::PrivateKeySigner;
        use std::str::FromStr;
        let signer = PrivateKeySigner::from_str(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        Arc::new(SettlementSigner::new(
            signer,
            8453,
            Address::from_str("0x2222222222222222222222222222222222222222").unwrap(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::store::{test_fixtures::trade, MemoryTradeStore};

    const PMM_ID: &str = "0x01";

    fn recv_addresses() -> HashMap<NetworkType, String> {
        let mut map = HashMap::new();
        map.insert(NetworkType::Btc, "bc1pexampleaddress".to_string());
        map.insert(
            NetworkType::Evm,
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
        );
        map
    }

    fn orchestrator(
        router: Arc<MockRouter>,
        store: Arc<MemoryTradeStore>,
        queue: Arc<RecordingQueue>,
    ) -> SettlementOrchestrator {
        SettlementOrchestrator::new(
            PMM_ID,
            router,
            store,
            queue,
            test_signer(),
            recv_addresses(),
        )
    }

    #[tokio::test]
    async fn commit_happy_path_signs_and_marks_committed() {
        let router = Arc::new(MockRouter::new());
        *router.trade.lock().unwrap() = Some(router_trade("0xabc", 1800));
        router.presigns.lock().unwrap().push(PresignEntry {
            pmm_id: PMM_ID.to_string(),
            pmm_recv_address: "bc1pexampleaddress".to_string(),
        });

        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Pending))
            .await
            .unwrap();

        let orch = orchestrator(router, store.clone(), Arc::new(RecordingQueue::default()));
        let before = Utc::now().timestamp();
        let commitment = orch.get_settlement_signature("0xabc").await.unwrap();

        assert!(commitment.signature.starts_with("0x"));
        assert!(commitment.deadline >= before + COMMIT_DEADLINE_SECS);
        let stored = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Committed);
    }

    #[tokio::test]
    async fn commit_fails_closed_on_address_mismatch() {
        let router = Arc::new(MockRouter::new());
        *router.trade.lock().unwrap() = Some(router_trade("0xabc", 1800));
        router.presigns.lock().unwrap().push(PresignEntry {
            pmm_id: PMM_ID.to_string(),
            pmm_recv_address: "bc1psomeoneelse".to_string(),
        });

        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Pending))
            .await
            .unwrap();

        let orch = orchestrator(router, store.clone(), Arc::new(RecordingQueue::default()));
        let err = orch.get_settlement_signature("0xabc").await.unwrap_err();
        assert!(matches!(err, SettlementError::AddressMismatch { .. }));

        // status untouched
        let stored = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Pending);
    }

    #[tokio::test]
    async fn commit_requires_own_presign_entry() {
        let router = Arc::new(MockRouter::new());
        *router.trade.lock().unwrap() = Some(router_trade("0xabc", 1800));
        router.presigns.lock().unwrap().push(PresignEntry {
            pmm_id: "0x99".to_string(),
            pmm_recv_address: "bc1pexampleaddress".to_string(),
        });

        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Pending))
            .await
            .unwrap();

        let orch = orchestrator(router, store, Arc::new(RecordingQueue::default()));
        let err = orch.get_settlement_signature("0xabc").await.unwrap_err();
        assert!(matches!(err, SettlementError::PresignMissing { .. }));
    }

    #[tokio::test]
    async fn ack_moves_to_selected_or_failed() {
        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xwin", TradeStatus::Committed))
            .await
            .unwrap();
        store
            .upsert(trade("0xlose", TradeStatus::Committed))
            .await
            .unwrap();

        let orch = orchestrator(
            Arc::new(MockRouter::new()),
            store.clone(),
            Arc::new(RecordingQueue::default()),
        );
        orch.ack_settlement("0xwin", true).await.unwrap();
        orch.ack_settlement("0xlose", false).await.unwrap();

        assert_eq!(
            store.get("0xwin").await.unwrap().unwrap().status,
            TradeStatus::Selected
        );
        assert_eq!(
            store.get("0xlose").await.unwrap().unwrap().status,
            TradeStatus::Failed
        );
    }

    #[tokio::test]
    async fn signal_payment_routes_to_destination_queue_and_sets_settling() {
        let router = Arc::new(MockRouter::new());
        let store = Arc::new(MemoryTradeStore::new());
        let queue = Arc::new(RecordingQueue::default());
        store
            .upsert(trade("0xabc", TradeStatus::Selected))
            .await
            .unwrap();

        let orch = orchestrator(router, store.clone(), queue.clone());
        orch.signal_payment("0xabc").await.unwrap();

        assert_eq!(
            store.get("0xabc").await.unwrap().unwrap().status,
            TradeStatus::Settling
        );
        let enqueued = queue.enqueued.lock().unwrap().clone();
        assert_eq!(enqueued.len(), 1);
        // destination token is EVM USDC -> EVM transfer queue
        assert_eq!(enqueued[0].0, QueueName::TransferEvm);
        assert_eq!(enqueued[0].1["trade_id"], "0xabc");
        assert_eq!(enqueued[0].1["retry_count"], 0);
    }

    #[tokio::test]
    async fn signal_payment_rejects_wrong_status() {
        let store = Arc::new(MemoryTradeStore::new());
        store
            .upsert(trade("0xabc", TradeStatus::Committed))
            .await
            .unwrap();

        let orch = orchestrator(
            Arc::new(MockRouter::new()),
            store,
            Arc::new(RecordingQueue::default()),
        );
        let err = orch.signal_payment("0xabc").await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidStatus { .. }));
    }

    #[test]
    fn queue_routing_per_family() {
        assert_eq!(transfer_queue_for(NetworkType::Evm), QueueName::TransferEvm);
        assert_eq!(transfer_queue_for(NetworkType::Btc), QueueName::TransferBtc);
        assert_eq!(transfer_queue_for(NetworkType::Tbtc), QueueName::TransferBtc);
        assert_eq!(
            transfer_queue_for(NetworkType::Solana),
            QueueName::TransferSolana
        );
    }
}
