use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;

const USER_AGENT: &str = "pmm-settler/1.0";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AggregatorClientError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    HttpClientBuild { source: reqwest::Error },

    #[snafu(display("HTTP request failed: {source}"))]
    HttpRequest { source: reqwest::Error },

    #[snafu(display("Aggregator returned {status} for {path}: {body}"))]
    UnexpectedStatus {
        status: StatusCode,
        path: String,
        body: String,
    },

    #[snafu(display("Invalid JSON response for {path}: {source}"))]
    JsonDecode {
        path: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, AggregatorClientError>;

/// Quote request for converting idle BTC into the target asset.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceQuoteRequest {
    /// Actual sats we will deposit (post-fee UTXO value, not the nominal ask).
    pub amount_sats: u64,
    pub from_asset: String,
    pub to_asset: String,
    /// Our own BTC address; the aggregator refunds here on failure.
    pub refund_address: String,
    /// Final recipient of the swapped asset (the liquidation vault).
    pub recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceQuote {
    /// Vault address to deposit the BTC into.
    pub deposit_address: String,
    /// Expected output in the target asset's units.
    pub amount_out: f64,
    /// Effective BTC/USD price this quote implies.
    pub quote_price: f64,
}

/// Aggregator-side status of a deposit, polled by deposit address.
/// Unrecognized strings are preserved rather than rejected so a provider-side
/// status addition never breaks the poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorSwapStatus {
    Success,
    Failed,
    Refunded,
    Processing,
    KnownDepositTx,
    PendingDeposit,
    IncompleteDeposit,
    Unknown(String),
}

impl From<&str> for AggregatorSwapStatus {
    fn from(s: &str) -> Self {
        match s {
            "SUCCESS" => AggregatorSwapStatus::Success,
            "FAILED" => AggregatorSwapStatus::Failed,
            "REFUNDED" => AggregatorSwapStatus::Refunded,
            "PROCESSING" => AggregatorSwapStatus::Processing,
            "KNOWN_DEPOSIT_TX" => AggregatorSwapStatus::KnownDepositTx,
            "PENDING_DEPOSIT" => AggregatorSwapStatus::PendingDeposit,
            "INCOMPLETE_DEPOSIT" => AggregatorSwapStatus::IncompleteDeposit,
            other => AggregatorSwapStatus::Unknown(other.to_string()),
        }
    }
}

/// HTTP client for the swap aggregator used by the rebalancing loop.
#[derive(Debug, Clone)]
pub struct AggregatorClient {
    http: Client,
    base_url: Url,
}

impl AggregatorClient {
    pub fn new(base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context(HttpClientBuildSnafu)?;

        Ok(Self { http, base_url })
    }

    pub async fn request_quote(&self, request: &RebalanceQuoteRequest) -> Result<RebalanceQuote> {
        let path = "v1/quote";
        let url = self.base_url.join(path).expect("aggregator URL join");
        debug!(amount_sats = request.amount_sats, "requesting rebalance quote");
        let resp = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .context(HttpRequestSnafu)?;
        let status = resp.status();
        let body = resp.text().await.context(HttpRequestSnafu)?;
        if !status.is_success() {
            return UnexpectedStatusSnafu {
                status,
                path: path.to_string(),
                body,
            }
            .fail();
        }
        serde_json::from_str(&body).context(JsonDecodeSnafu {
            path: path.to_string(),
        })
    }

    /// Proactively tell the aggregator about our deposit txid. Best effort:
    /// callers treat failures as non-fatal because the aggregator's own chain
    /// monitoring detects the deposit eventually.
    pub async fn submit_deposit(&self, deposit_address: &str, tx_id: &str) -> Result<()> {
        let path = format!("v1/deposits/{deposit_address}");
        let url = self.base_url.join(&path).expect("aggregator URL join");
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "tx_id": tx_id }))
            .send()
            .await
            .context(HttpRequestSnafu)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.context(HttpRequestSnafu)?;
            return UnexpectedStatusSnafu { status, path, body }.fail();
        }
        Ok(())
    }

    pub async fn get_status(&self, deposit_address: &str) -> Result<AggregatorSwapStatus> {
        #[derive(Deserialize)]
        struct StatusResponse {
            status: String,
        }
        let path = format!("v1/deposits/{deposit_address}/status");
        let url = self.base_url.join(&path).expect("aggregator URL join");
        let resp = self.http.get(url).send().await.context(HttpRequestSnafu)?;
        let status = resp.status();
        let body = resp.text().await.context(HttpRequestSnafu)?;
        if !status.is_success() {
            return UnexpectedStatusSnafu { status, path, body }.fail();
        }
        let parsed: StatusResponse = serde_json::from_str(&body).context(JsonDecodeSnafu { path })?;
        Ok(AggregatorSwapStatus::from(parsed.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_statuses_map_to_variants() {
        assert_eq!(
            AggregatorSwapStatus::from("SUCCESS"),
            AggregatorSwapStatus::Success
        );
        assert_eq!(
            AggregatorSwapStatus::from("KNOWN_DEPOSIT_TX"),
            AggregatorSwapStatus::KnownDepositTx
        );
        assert_eq!(
            AggregatorSwapStatus::from("INCOMPLETE_DEPOSIT"),
            AggregatorSwapStatus::IncompleteDeposit
        );
    }

    #[test]
    fn unknown_status_is_preserved_not_rejected() {
        let status = AggregatorSwapStatus::from("HALTED_FOR_MAINTENANCE");
        assert_eq!(
            status,
            AggregatorSwapStatus::Unknown("HALTED_FOR_MAINTENANCE".to_string())
        );
    }
}
