//! Repository seams for trades and rebalancing records.
//!
//! Persistence technology is a collaborator, not part of this core; the
//! daemon only needs keyed CRUD plus a status compare-and-swap. The CAS is
//! what stage handlers use as their single-flight guard: a handler that loses
//! the swap knows another worker (or a redelivered job) already advanced the
//! record and must skip.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use settler_models::{RebalancingRecord, RebalancingStatus, Trade, TradeStatus};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Trade {trade_id} not found"))]
    TradeNotFound { trade_id: String },

    #[snafu(display("Rebalancing record {rebalancing_id} not found"))]
    RebalancingNotFound { rebalancing_id: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn get(&self, trade_id: &str) -> Result<Option<Trade>>;

    /// Insert or replace; replacement is the delete-then-recreate path used
    /// when a trade is re-quoted under the same id.
    async fn upsert(&self, trade: Trade) -> Result<()>;

    async fn set_status(&self, trade_id: &str, status: TradeStatus) -> Result<()>;

    /// Atomically move `trade_id` from `expected` to `next`. Returns false
    /// (without modifying anything) when the current status is not
    /// `expected`.
    async fn set_status_if(
        &self,
        trade_id: &str,
        expected: TradeStatus,
        next: TradeStatus,
    ) -> Result<bool>;

    async fn set_retry_count(&self, trade_id: &str, retry_count: u32) -> Result<()>;

    async fn delete(&self, trade_id: &str) -> Result<()>;
}

#[async_trait]
pub trait RebalancingStore: Send + Sync {
    async fn get(&self, rebalancing_id: &str) -> Result<Option<RebalancingRecord>>;

    async fn insert(&self, record: RebalancingRecord) -> Result<()>;

    /// Full-row update keyed by `rebalancing_id`.
    async fn update(&self, record: RebalancingRecord) -> Result<()>;

    async fn list_by_status(
        &self,
        statuses: &[RebalancingStatus],
    ) -> Result<Vec<RebalancingRecord>>;

    /// Atomically move the record from `expected` to `next`; false when the
    /// current status does not match.
    async fn set_status_if(
        &self,
        rebalancing_id: &str,
        expected: RebalancingStatus,
        next: RebalancingStatus,
    ) -> Result<bool>;
}

/// DashMap-backed store used by the daemon when no external store is wired
/// in, and by the tests.
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: DashMap<String, Trade>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn get(&self, trade_id: &str) -> Result<Option<Trade>> {
        Ok(self.trades.get(trade_id).map(|t| t.clone()))
    }

    async fn upsert(&self, trade: Trade) -> Result<()> {
        self.trades.insert(trade.trade_id.clone(), trade);
        Ok(())
    }

    async fn set_status(&self, trade_id: &str, status: TradeStatus) -> Result<()> {
        let mut entry = self
            .trades
            .get_mut(trade_id)
            .ok_or_else(|| StoreError::TradeNotFound {
                trade_id: trade_id.to_string(),
            })?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status_if(
        &self,
        trade_id: &str,
        expected: TradeStatus,
        next: TradeStatus,
    ) -> Result<bool> {
        let mut entry = self
            .trades
            .get_mut(trade_id)
            .ok_or_else(|| StoreError::TradeNotFound {
                trade_id: trade_id.to_string(),
            })?;
        if entry.status != expected {
            return Ok(false);
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_retry_count(&self, trade_id: &str, retry_count: u32) -> Result<()> {
        let mut entry = self
            .trades
            .get_mut(trade_id)
            .ok_or_else(|| StoreError::TradeNotFound {
                trade_id: trade_id.to_string(),
            })?;
        entry.retry_count = retry_count;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, trade_id: &str) -> Result<()> {
        self.trades.remove(trade_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRebalancingStore {
    records: DashMap<String, RebalancingRecord>,
}

impl MemoryRebalancingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RebalancingStore for MemoryRebalancingStore {
    async fn get(&self, rebalancing_id: &str) -> Result<Option<RebalancingRecord>> {
        Ok(self.records.get(rebalancing_id).map(|r| r.clone()))
    }

    async fn insert(&self, record: RebalancingRecord) -> Result<()> {
        self.records.insert(record.rebalancing_id.clone(), record);
        Ok(())
    }

    async fn update(&self, mut record: RebalancingRecord) -> Result<()> {
        if !self.records.contains_key(&record.rebalancing_id) {
            return Err(StoreError::RebalancingNotFound {
                rebalancing_id: record.rebalancing_id,
            });
        }
        record.updated_at = Utc::now();
        self.records.insert(record.rebalancing_id.clone(), record);
        Ok(())
    }

    async fn list_by_status(
        &self,
        statuses: &[RebalancingStatus],
    ) -> Result<Vec<RebalancingRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .map(|r| r.clone())
            .collect())
    }

    async fn set_status_if(
        &self,
        rebalancing_id: &str,
        expected: RebalancingStatus,
        next: RebalancingStatus,
    ) -> Result<bool> {
        let mut entry = self.records.get_mut(rebalancing_id).ok_or_else(|| {
            StoreError::RebalancingNotFound {
                rebalancing_id: rebalancing_id.to_string(),
            }
        })?;
        if entry.status != expected {
            return Ok(false);
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use alloy::primitives::U256;
    use chrono::Utc;
    use settler_models::{Trade, TradeStatus, TradeType};

    pub fn trade(trade_id: &str, status: TradeStatus) -> Trade {
        let now = Utc::now();
        Trade {
            trade_id: trade_id.to_string(),
            status,
            from_token_id: "btc-native".to_string(),
            to_token_id: "usdc-8453".to_string(),
            from_user: "bc1pexample".to_string(),
            to_user: "0x1111111111111111111111111111111111111111".to_string(),
            amount: U256::from(250_000_000u64),
            trade_deadline: now.timestamp() + 1800,
            script_deadline: now.timestamp() + 3600,
            trade_type: TradeType::Swap,
            is_liquid: false,
            commitment_quote: "250000000".to_string(),
            settlement_quote: None,
            metadata: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::trade;
    use super::*;

    #[tokio::test]
    async fn cas_succeeds_only_from_expected_status() {
        let store = MemoryTradeStore::new();
        store
            .upsert(trade("0xabc", TradeStatus::Selected))
            .await
            .unwrap();

        let moved = store
            .set_status_if("0xabc", TradeStatus::Selected, TradeStatus::Settling)
            .await
            .unwrap();
        assert!(moved);

        // second swap from the same expected state loses
        let moved = store
            .set_status_if("0xabc", TradeStatus::Selected, TradeStatus::Settling)
            .await
            .unwrap();
        assert!(!moved);

        let current = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(current.status, TradeStatus::Settling);
    }

    #[tokio::test]
    async fn cas_on_missing_trade_is_an_error() {
        let store = MemoryTradeStore::new();
        let err = store
            .set_status_if("0xmissing", TradeStatus::Selected, TradeStatus::Settling)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TradeNotFound { .. }));
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = MemoryTradeStore::new();
        store
            .upsert(trade("0xabc", TradeStatus::Committed))
            .await
            .unwrap();
        // re-quote path: same id, fresh row
        let mut fresh = trade("0xabc", TradeStatus::Pending);
        fresh.commitment_quote = "260000000".to_string();
        store.upsert(fresh).await.unwrap();

        let current = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(current.status, TradeStatus::Pending);
        assert_eq!(current.commitment_quote, "260000000");
    }
}
