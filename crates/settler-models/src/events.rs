use serde::{Deserialize, Serialize};

/// Queue names the settlement and rebalance stages hand work off through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    TransferEvm,
    TransferBtc,
    TransferSolana,
    SubmitSettlement,
    RebalanceQuote,
    RebalanceTransfer,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::TransferEvm => "transfer-evm",
            QueueName::TransferBtc => "transfer-btc",
            QueueName::TransferSolana => "transfer-solana",
            QueueName::SubmitSettlement => "submit-settlement",
            QueueName::RebalanceQuote => "rebalance-quote",
            QueueName::RebalanceTransfer => "rebalance-transfer",
        }
    }
}

/// Job: execute the destination-chain transfer for a selected trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettlementEvent {
    pub trade_id: String,
    #[serde(default)]
    pub retry_count: u32,
}

/// Job: sign and submit the settlement proof for a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSettlementEvent {
    pub trade_id: String,
    pub payment_tx_id: String,
}

/// Job: request and evaluate an aggregator quote for a pending rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceQuoteJob {
    pub rebalancing_id: String,
}

/// Job: send BTC to the quoted aggregator deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceTransferJob {
    pub rebalancing_id: String,
    #[serde(default)]
    pub retry_count: u32,
}
