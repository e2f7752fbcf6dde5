use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BPS_DENOM: u64 = 10_000;

/// Lifecycle of one idle-BTC rebalance attempt.
///
/// `Pending → QuoteRequested → QuoteAccepted → DepositSubmitted →
/// SwapProcessing → {Completed | Refunded}`. Failures roll back to a
/// retryable predecessor (`Pending` for quote problems, `QuoteAccepted` for
/// transfer problems); the scheduler parks exhausted records in `Stuck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalancingStatus {
    Pending,
    QuoteRequested,
    QuoteAccepted,
    DepositSubmitted,
    SwapProcessing,
    Completed,
    Refunded,
    Stuck,
}

impl RebalancingStatus {
    pub fn can_transition_to(&self, next: RebalancingStatus) -> bool {
        use RebalancingStatus::*;
        matches!(
            (self, next),
            (Pending, QuoteRequested)
                | (QuoteRequested, QuoteAccepted)
                | (QuoteAccepted, DepositSubmitted)
                | (DepositSubmitted, SwapProcessing)
                | (DepositSubmitted, Completed)
                | (DepositSubmitted, Refunded)
                | (SwapProcessing, Completed)
                | (SwapProcessing, Refunded)
                // rollbacks to a retryable predecessor
                | (QuoteRequested, Pending)
                | (QuoteAccepted, Pending)
                | (DepositSubmitted, Pending)
                | (SwapProcessing, Pending)
                | (DepositSubmitted, QuoteAccepted)
                // scheduler gives up
                | (Pending, Stuck)
                | (QuoteRequested, Stuck)
                | (QuoteAccepted, Stuck)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RebalancingStatus::Completed | RebalancingStatus::Refunded | RebalancingStatus::Stuck
        )
    }
}

/// One inventory-rebalance attempt: idle BTC → aggregator swap → target asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancingRecord {
    /// Numeric surrogate key.
    pub id: u64,
    /// Hex correlation id used in queue job ids and operator messages.
    pub rebalancing_id: String,
    /// Hash of the settled trade whose inventory is being recycled.
    pub trade_hash: String,

    /// Requested amount in sats.
    pub amount: u64,
    /// Actual UTXO value available after fees; the amount quoted and sent.
    pub real_amount: u64,

    pub status: RebalancingStatus,

    /// Aggregator vault to deposit into, set once a quote is accepted.
    pub deposit_address: Option<String>,

    pub oracle_price: Option<f64>,
    pub quote_price: Option<f64>,
    pub expected_usdc: Option<f64>,
    pub actual_usdc: Option<f64>,
    pub slippage_bps: Option<u64>,

    /// Txid of our BTC deposit into the aggregator vault.
    pub vault_tx_id: Option<String>,

    pub error: Option<String>,
    pub retry_count: u32,

    /// When the source trade completed; the scheduler measures the max retry
    /// window against this.
    pub trade_completed_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Absolute deviation between the quoted price and the oracle price in basis
/// points, rounded down. The acceptance rule is `bps <= threshold`.
pub fn slippage_bps(oracle_price: f64, quote_price: f64) -> u64 {
    if oracle_price <= 0.0 {
        return u64::MAX;
    }
    let deviation = (quote_price - oracle_price).abs() / oracle_price;
    (deviation * BPS_DENOM as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use RebalancingStatus::*;
        let path = [
            Pending,
            QuoteRequested,
            QuoteAccepted,
            DepositSubmitted,
            SwapProcessing,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn rollbacks_and_dead_ends() {
        use RebalancingStatus::*;
        assert!(QuoteRequested.can_transition_to(Pending));
        assert!(DepositSubmitted.can_transition_to(QuoteAccepted));
        assert!(Pending.can_transition_to(Stuck));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Refunded.can_transition_to(Pending));
        assert!(!Stuck.can_transition_to(Pending));
        assert!(Completed.is_terminal());
        assert!(Refunded.is_terminal());
        assert!(Stuck.is_terminal());
    }

    #[test]
    fn slippage_bps_matches_expected_values() {
        // |50200 - 50000| / 50000 * 10000 = 40 bps
        assert_eq!(slippage_bps(50_000.0, 50_200.0), 40);
        // symmetric
        assert_eq!(slippage_bps(50_000.0, 49_800.0), 40);
        // exact match
        assert_eq!(slippage_bps(50_000.0, 50_000.0), 0);
        // degenerate oracle price fails closed
        assert_eq!(slippage_bps(0.0, 50_000.0), u64::MAX);
    }

    #[test]
    fn slippage_boundary_is_inclusive() {
        let threshold = 50u64;
        // exactly at threshold: accept
        let at = slippage_bps(50_000.0, 50_250.0);
        assert_eq!(at, 50);
        assert!(at <= threshold);
        // one bps over: reject
        let over = slippage_bps(50_000.0, 50_255.0);
        assert_eq!(over, 51);
        assert!(over > threshold);
    }
}
