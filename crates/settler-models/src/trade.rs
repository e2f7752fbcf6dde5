use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{serde_utils::u256_decimal, TradeType};

/// Settlement lifecycle of a single trade.
///
/// Transitions are forward-only: `Pending → Committed → Selected → Settling →
/// Completed`, with `Failed` reachable from `Selected` (this PMM was not
/// chosen). Transient transfer failures are retried at the job level and do
/// not move the status. A superseding re-quote deletes and recreates the row
/// under the same trade id; there is no in-place rollback past `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Committed,
    Selected,
    Settling,
    Completed,
    Failed,
}

impl TradeStatus {
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Pending, Committed)
                | (Committed, Selected)
                | (Committed, Failed)
                | (Selected, Settling)
                | (Selected, Failed)
                | (Settling, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Failed)
    }
}

/// One cross-chain swap instance assigned (or assignable) to this PMM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Opaque on-chain identifier, 0x-prefixed hex.
    pub trade_id: String,
    pub status: TradeStatus,

    pub from_token_id: String,
    pub to_token_id: String,
    pub from_user: String,
    pub to_user: String,

    #[serde(with = "u256_decimal")]
    pub amount: U256,

    /// Unix seconds. Once `trade_deadline` passes, settlement transfer jobs
    /// abort without retrying.
    pub trade_deadline: i64,
    pub script_deadline: i64,

    pub trade_type: TradeType,
    pub is_liquid: bool,

    /// Decimal string amounts as quoted.
    pub commitment_quote: String,
    pub settlement_quote: Option<String>,

    /// Opaque payload forwarded from the router (e.g. liquidation payment
    /// metadata); never interpreted here beyond pass-through.
    pub metadata: Option<serde_json::Value>,

    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.trade_deadline < now.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use TradeStatus::*;
        assert!(Pending.can_transition_to(Committed));
        assert!(Committed.can_transition_to(Selected));
        assert!(Selected.can_transition_to(Settling));
        assert!(Settling.can_transition_to(Completed));

        // no going back
        assert!(!Settling.can_transition_to(Selected));
        assert!(!Completed.can_transition_to(Settling));
        assert!(!Selected.can_transition_to(Committed));
    }

    #[test]
    fn failed_reachable_only_before_settling() {
        use TradeStatus::*;
        assert!(Committed.can_transition_to(Failed));
        assert!(Selected.can_transition_to(Failed));
        assert!(!Settling.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(TradeStatus::Completed.is_terminal());
        assert!(TradeStatus::Failed.is_terminal());
        assert!(!TradeStatus::Settling.is_terminal());
    }

    #[test]
    fn expiry_uses_trade_deadline() {
        let now = Utc::now();
        let trade = Trade {
            trade_id: "0xabc".into(),
            status: TradeStatus::Selected,
            from_token_id: "btc".into(),
            to_token_id: "usdc-eth".into(),
            from_user: "bc1p...".into(),
            to_user: "0xdead".into(),
            amount: U256::from(1u64),
            trade_deadline: now.timestamp() - 1,
            script_deadline: now.timestamp() + 600,
            trade_type: TradeType::Swap,
            is_liquid: false,
            commitment_quote: "100".into(),
            settlement_quote: None,
            metadata: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(trade.is_expired(now));
    }
}
