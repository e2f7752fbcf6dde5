use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use snafu::Snafu;
use tracing::warn;
use url::Url;

use crate::{race_providers, ProviderRaceError, RetryPolicy};

/// Multiplicative buffer applied to the cheapest fee-rate estimate.
const FEE_RATE_BUFFER: f64 = 1.125;
/// Used when no provider can produce a fee estimate at all.
const FALLBACK_FEE_RATE: f64 = 5.0;

#[derive(Debug, Snafu)]
pub enum BitcoinDataError {
    #[snafu(display("Bitcoin data providers exhausted: {}", source))]
    ProvidersExhausted { source: ProviderRaceError },

    #[snafu(display("Failed to build HTTP client: {}", source))]
    HttpClientBuild { source: reqwest::Error },

    #[snafu(display("Invalid provider URL {url}: {reason}"))]
    InvalidProviderUrl { url: String, reason: String },
}

pub type Result<T, E = BitcoinDataError> = std::result::Result<T, E>;

/// An unspent output as reported by an explorer backend. Fetched fresh per
/// operation; never cached across calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub status: UtxoStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtxoStatus {
    #[serde(default)]
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxStatus {
    #[serde(default)]
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

/// Read/broadcast access to Bitcoin through N redundant esplora-compatible
/// HTTP backends. Every call races all configured backends and takes the
/// first valid answer.
pub struct BitcoinDataClient {
    http: Client,
    providers: Vec<Url>,
    policy: RetryPolicy,
}

impl BitcoinDataClient {
    pub fn new(provider_urls: &[String], policy: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| BitcoinDataError::HttpClientBuild { source })?;

        let providers = provider_urls
            .iter()
            .map(|u| {
                Url::parse(u).map_err(|e| BitcoinDataError::InvalidProviderUrl {
                    url: u.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            http,
            providers,
            policy,
        })
    }

    pub async fn get_address_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        race_providers("get_address_utxos", self.providers.len(), &self.policy, |i| {
            let url = join(&self.providers[i], &format!("address/{address}/utxo"));
            let http = self.http.clone();
            async move {
                let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
                let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                resp.json::<Vec<Utxo>>().await.map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|source| BitcoinDataError::ProvidersExhausted { source })
    }

    /// Confirmation-target → sat/vB map, e.g. `{1: 12.0, 3: 9.5, 144: 2.1}`.
    /// Providers drift on this endpoint's shape, so a strict-parse failure
    /// falls back to scraping numeric entries out of the raw object.
    pub async fn get_fee_estimates(&self) -> Result<BTreeMap<u16, f64>> {
        race_providers("get_fee_estimates", self.providers.len(), &self.policy, |i| {
            let url = join(&self.providers[i], "fee-estimates");
            let http = self.http.clone();
            async move {
                let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
                let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                let raw: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;

                match serde_json::from_value::<BTreeMap<u16, f64>>(raw.clone()) {
                    Ok(map) if !map.is_empty() => Ok(map),
                    _ => {
                        warn!("fee-estimates response failed strict parse, extracting permissively");
                        let map = permissive_fee_map(&raw);
                        if map.is_empty() {
                            Err("no usable fee estimates in response".to_string())
                        } else {
                            Ok(map)
                        }
                    }
                }
            }
        })
        .await
        .map_err(|source| BitcoinDataError::ProvidersExhausted { source })
    }

    /// Fee rate to pay now, in sat/vB: the cheapest confirmation-target
    /// estimate with a 12.5% buffer, or 5 sat/vB if no estimates are
    /// available anywhere.
    pub async fn recommended_fee_rate(&self) -> f64 {
        match self.get_fee_estimates().await {
            Ok(estimates) => {
                let cheapest = estimates
                    .values()
                    .copied()
                    .fold(f64::INFINITY, f64::min);
                if cheapest.is_finite() {
                    cheapest * FEE_RATE_BUFFER
                } else {
                    FALLBACK_FEE_RATE
                }
            }
            Err(e) => {
                warn!(error = %e, "fee estimate lookup failed, using fallback rate");
                FALLBACK_FEE_RATE
            }
        }
    }

    /// Broadcast raw transaction hex; returns the txid echoed by the winning
    /// provider.
    pub async fn broadcast_tx(&self, tx_hex: &str) -> Result<String> {
        let tx_hex = tx_hex.to_string();
        race_providers("broadcast_tx", self.providers.len(), &self.policy, |i| {
            let url = join(&self.providers[i], "tx");
            let http = self.http.clone();
            let body = tx_hex.clone();
            async move {
                let resp = http.post(url).body(body).send().await.map_err(|e| e.to_string())?;
                let status = resp.status();
                let text = resp.text().await.map_err(|e| e.to_string())?;
                if !status.is_success() {
                    return Err(format!("broadcast rejected ({status}): {text}"));
                }
                Ok(text.trim().to_string())
            }
        })
        .await
        .map_err(|source| BitcoinDataError::ProvidersExhausted { source })
    }

    pub async fn get_tx_status(&self, txid: &str) -> Result<TxStatus> {
        race_providers("get_tx_status", self.providers.len(), &self.policy, |i| {
            let url = join(&self.providers[i], &format!("tx/{txid}/status"));
            let http = self.http.clone();
            async move {
                let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
                let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                resp.json::<TxStatus>().await.map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|source| BitcoinDataError::ProvidersExhausted { source })
    }

    pub async fn get_tip_height(&self) -> Result<u64> {
        race_providers("get_tip_height", self.providers.len(), &self.policy, |i| {
            let url = join(&self.providers[i], "blocks/tip/height");
            let http = self.http.clone();
            async move {
                let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
                let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                let text = resp.text().await.map_err(|e| e.to_string())?;
                text.trim().parse::<u64>().map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|source| BitcoinDataError::ProvidersExhausted { source })
    }

    /// Confirmations for a txid, 0 while still in the mempool.
    pub async fn get_tx_confirmations(&self, txid: &str) -> Result<u64> {
        let status = self.get_tx_status(txid).await?;
        if !status.confirmed {
            return Ok(0);
        }
        let tip = self.get_tip_height().await?;
        Ok(match status.block_height {
            Some(height) if tip >= height => tip - height + 1,
            _ => 1,
        })
    }
}

fn join(base: &Url, path: &str) -> Url {
    // Base URLs are validated at construction; joining a relative path onto
    // them cannot fail.
    base.join(path).expect("provider URL join")
}

fn permissive_fee_map(raw: &serde_json::Value) -> BTreeMap<u16, f64> {
    let mut map = BTreeMap::new();
    if let Some(obj) = raw.as_object() {
        for (k, v) in obj {
            let target = match k.parse::<u16>() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let rate = match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            };
            if let Some(rate) = rate {
                if rate.is_finite() && rate > 0.0 {
                    map.insert(target, rate);
                }
            }
        }
    }
    map
}
