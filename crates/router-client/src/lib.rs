use std::time::Duration;

use alloy::primitives::U256;
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use settler_models::{serde_utils::u256_decimal, Token};
use snafu::prelude::*;
use tracing::debug;

const USER_AGENT: &str = "pmm-settler/1.0";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RouterClientError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    HttpClientBuild { source: reqwest::Error },

    #[snafu(display("HTTP request failed: {source}"))]
    HttpRequest { source: reqwest::Error },

    #[snafu(display("Router returned {status} for {path}: {body}"))]
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

    #[snafu(display("Invalid request: {reason} at {loc}"))]
    InvalidRequest {
        reason: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Malformed chain tuple field {field}: {reason}"))]
    MalformedChainTuple { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RouterClientError>;

/// Which PMM the router selected for a trade, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmmSelection {
    pub trade_id: String,
    pub selected_pmm_id: String,
}

/// One presign entry the router recorded for a trade: the binding between a
/// PMM identity and the receiving address it committed to settle from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignEntry {
    pub pmm_id: String,
    pub pmm_recv_address: String,
}

/// A chain reference as the router encodes it on the wire: hex-encoded UTF-8
/// fields `(network_id, token, address)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedChain {
    pub network_id: String,
    pub token: String,
    pub address: String,
}

/// Decoded destination: which network, which token contract, which recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChain {
    pub network_id: String,
    pub token_address: String,
    pub recipient: String,
}

impl EncodedChain {
    pub fn decode(&self) -> Result<DecodedChain> {
        Ok(DecodedChain {
            network_id: decode_hex_utf8("network_id", &self.network_id)?,
            token_address: decode_hex_utf8("token", &self.token)?,
            recipient: decode_hex_utf8("address", &self.address)?,
        })
    }
}

fn decode_hex_utf8(field: &str, value: &str) -> Result<String> {
    let bytes = alloy::hex::decode(value.trim_start_matches("0x")).map_err(|e| {
        RouterClientError::MalformedChainTuple {
            field: field.to_string(),
            reason: e.to_string(),
        }
    })?;
    String::from_utf8(bytes).map_err(|e| RouterClientError::MalformedChainTuple {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

/// The full trade struct as the router holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterTrade {
    pub trade_id: String,
    pub from_chain: EncodedChain,
    pub to_chain: EncodedChain,
    #[serde(with = "u256_decimal")]
    pub amount_out: U256,
    /// Unix seconds.
    pub trade_deadline: i64,
    pub script_deadline: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeDetails {
    pub trade_id: String,
    #[serde(with = "u256_decimal")]
    pub protocol_fee: U256,
}

/// Per-network protocol deployment info, selected by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetChainConfig {
    pub network_id: String,
    pub contract_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetChainRole {
    Payment,
    Liquidation,
}

impl AssetChainRole {
    fn as_query(&self) -> &'static str {
        match self {
            AssetChainRole::Payment => "payment",
            AssetChainRole::Liquidation => "liquidation",
        }
    }
}

/// Settlement proof payload POSTed to the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSettlementRequest {
    pub trade_ids: Vec<String>,
    pub pmm_id: String,
    pub settlement_tx: String,
    pub signature: String,
    pub start_index: u64,
    pub signed_at: i64,
}

/// HTTP client for the router/solver service (trade data, presigns, fees,
/// asset-chain config, settlement submission) and the token directory it
/// fronts.
#[derive(Debug, Clone)]
pub struct RouterClient {
    http: Client,
    base_url: Url,
}

impl RouterClient {
    pub fn new(base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context(HttpClientBuildSnafu)?;

        Ok(Self { http, base_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.join(path)?;
        debug!(%url, "router GET");
        let resp = self.http.get(url).send().await.context(HttpRequestSnafu)?;
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

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            InvalidRequestSnafu {
                reason: format!("failed to construct URL for {path}: {e}"),
            }
            .build()
        })
    }

    pub async fn get_pmm_selection(&self, trade_id: &str) -> Result<Option<PmmSelection>> {
        let path = format!("v1/trades/{trade_id}/selection");
        let url = self.join(&path)?;
        let resp = self.http.get(url).send().await.context(HttpRequestSnafu)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.text().await.context(HttpRequestSnafu)?;
        if !status.is_success() {
            return UnexpectedStatusSnafu {
                status,
                path,
                body,
            }
            .fail();
        }
        serde_json::from_str(&body)
            .map(Some)
            .context(JsonDecodeSnafu { path })
    }

    pub async fn get_trade_data(&self, trade_id: &str) -> Result<RouterTrade> {
        self.get_json(&format!("v1/trades/{trade_id}")).await
    }

    pub async fn get_settlement_presigns(&self, trade_id: &str) -> Result<Vec<PresignEntry>> {
        self.get_json(&format!("v1/trades/{trade_id}/presigns")).await
    }

    /// Address of the signer the router expects settlement signatures from.
    pub async fn get_signer(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct SignerResponse {
            signer: String,
        }
        Ok(self.get_json::<SignerResponse>("v1/signer").await?.signer)
    }

    /// Address of the on-chain router contract (the EIP-712 verifying
    /// contract for settlement signatures).
    pub async fn get_router(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct RouterResponse {
            router: String,
        }
        Ok(self.get_json::<RouterResponse>("v1/router").await?.router)
    }

    pub async fn get_fee_details(&self, trade_id: &str) -> Result<FeeDetails> {
        self.get_json(&format!("v1/trades/{trade_id}/fees")).await
    }

    pub async fn get_asset_chain_config(
        &self,
        network_id: &str,
        role: AssetChainRole,
    ) -> Result<AssetChainConfig> {
        self.get_json(&format!(
            "v1/chains/{network_id}/config?role={}",
            role.as_query()
        ))
        .await
    }

    pub async fn submit_settlement_tx(&self, payload: &SubmitSettlementRequest) -> Result<()> {
        let path = "v1/settlements";
        let url = self.join(path)?;
        debug!(trade_ids = ?payload.trade_ids, "submitting settlement proof");
        let resp = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .context(HttpRequestSnafu)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.context(HttpRequestSnafu)?;
            return UnexpectedStatusSnafu {
                status,
                path: path.to_string(),
                body,
            }
            .fail();
        }
        Ok(())
    }

    // --- token directory ---

    pub async fn get_token(&self, network_id: &str, address: &str) -> Result<Token> {
        self.get_json(&format!("v1/tokens/{network_id}/{address}")).await
    }

    pub async fn get_token_by_token_id(&self, token_id: &str) -> Result<Token> {
        self.get_json(&format!("v1/tokens/{token_id}")).await
    }
}
