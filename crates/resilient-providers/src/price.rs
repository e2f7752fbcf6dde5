use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use snafu::Snafu;
use tracing::{debug, warn};
use url::Url;

use crate::{race_providers, ProviderRaceError, RetryPolicy};

const PRICE_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum PriceError {
    #[snafu(display("Price providers exhausted: {}", source))]
    ProvidersExhausted { source: ProviderRaceError },

    #[snafu(display("Failed to build HTTP client: {}", source))]
    HttpClientBuild { source: reqwest::Error },

    #[snafu(display("Invalid price provider URL {url}: {reason}"))]
    InvalidProviderUrl { url: String, reason: String },
}

pub type Result<T, E = PriceError> = std::result::Result<T, E>;

/// Which quoting API shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceProviderKind {
    /// `GET {base}/api/v3/ticker/price?symbol=BTCUSDT` → `{"price": "50123.4"}`
    ExchangeTicker,
    /// `GET {base}/api/v3/simple/price?ids=bitcoin&vs_currencies=usd`
    /// → `{"bitcoin": {"usd": 50123.4}}`
    SimplePrice,
}

#[derive(Debug, Clone)]
pub struct PriceProvider {
    pub base_url: Url,
    pub kind: PriceProviderKind,
}

impl PriceProvider {
    pub fn new(base_url: &str, kind: PriceProviderKind) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url).map_err(|e| PriceError::InvalidProviderUrl {
                url: base_url.to_string(),
                reason: e.to_string(),
            })?,
            kind,
        })
    }
}

/// USD price lookups raced across two independent oracles, with a short TTL
/// cache and a wrapped-symbol canonicalization step so WBTC/TBTC/WETH/WSOL
/// callers share cache entries with their underlying asset.
pub struct PriceClient {
    http: Client,
    providers: Vec<PriceProvider>,
    policy: RetryPolicy,
    cache: DashMap<String, (f64, Instant)>,
}

/// Wrapped-token symbols resolve to the asset they track before lookup.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    match upper.as_str() {
        "WBTC" | "TBTC" | "CBBTC" => "BTC".to_string(),
        "WETH" => "ETH".to_string(),
        "WSOL" => "SOL".to_string(),
        _ => upper,
    }
}

fn is_stablecoin(normalized: &str) -> bool {
    matches!(normalized, "USDT" | "USDC" | "DAI" | "BUSD" | "TUSD")
}

/// CoinGecko-style APIs key by asset id instead of ticker symbol.
fn simple_price_id(normalized: &str) -> String {
    match normalized {
        "BTC" => "bitcoin".to_string(),
        "ETH" => "ethereum".to_string(),
        "SOL" => "solana".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

impl PriceClient {
    pub fn new(providers: Vec<PriceProvider>, policy: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|source| PriceError::HttpClientBuild { source })?;

        Ok(Self {
            http,
            providers,
            policy,
            cache: DashMap::new(),
        })
    }

    /// USD price for a token symbol. Stablecoins short-circuit to 1.0 with no
    /// network call; everything else is cached for 60 s under its normalized
    /// symbol.
    pub async fn get_usd_price(&self, symbol: &str) -> Result<f64> {
        let normalized = normalize_symbol(symbol);

        if is_stablecoin(&normalized) {
            return Ok(1.0);
        }

        if let Some(entry) = self.cache.get(&normalized) {
            let (price, fetched_at) = *entry;
            if fetched_at.elapsed() < PRICE_CACHE_TTL {
                debug!(symbol = %normalized, price, "price cache hit");
                return Ok(price);
            }
        }

        let price = race_providers(
            "get_usd_price",
            self.providers.len(),
            &self.policy,
            |i| self.fetch_from(&self.providers[i], &normalized),
        )
        .await
        .map_err(|source| PriceError::ProvidersExhausted { source })?;

        self.cache.insert(normalized, (price, Instant::now()));
        Ok(price)
    }

    async fn fetch_from(
        &self,
        provider: &PriceProvider,
        normalized: &str,
    ) -> std::result::Result<f64, String> {
        let url = match provider.kind {
            PriceProviderKind::ExchangeTicker => {
                let mut url = provider
                    .base_url
                    .join("api/v3/ticker/price")
                    .map_err(|e| e.to_string())?;
                url.query_pairs_mut()
                    .append_pair("symbol", &format!("{normalized}USDT"));
                url
            }
            PriceProviderKind::SimplePrice => {
                let mut url = provider
                    .base_url
                    .join("api/v3/simple/price")
                    .map_err(|e| e.to_string())?;
                url.query_pairs_mut()
                    .append_pair("ids", &simple_price_id(normalized))
                    .append_pair("vs_currencies", "usd");
                url
            }
        };

        let resp = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        let resp = resp.error_for_status().map_err(|e| e.to_string())?;
        let raw: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;

        let typed = match provider.kind {
            PriceProviderKind::ExchangeTicker => {
                #[derive(Deserialize)]
                struct Ticker {
                    price: String,
                }
                serde_json::from_value::<Ticker>(raw.clone())
                    .ok()
                    .and_then(|t| t.price.parse::<f64>().ok())
            }
            PriceProviderKind::SimplePrice => raw
                .get(simple_price_id(normalized))
                .and_then(|v| v.get("usd"))
                .and_then(|v| v.as_f64()),
        };

        // Providers drift on response shape; a strict-parse miss falls back
        // to pulling the first plausible number out of the payload.
        let price = match typed {
            Some(p) => p,
            None => {
                warn!(symbol = %normalized, "price response failed strict parse, extracting permissively");
                extract_price_permissive(&raw).ok_or("no numeric price in response")?
            }
        };

        if !price.is_finite() || price <= 0.0 {
            return Err(format!("non-positive price {price}"));
        }
        Ok(price)
    }
}

fn extract_price_permissive(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|p| p.is_finite() && *p > 0.0),
        serde_json::Value::String(s) => {
            s.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0)
        }
        serde_json::Value::Object(map) => map.values().find_map(extract_price_permissive),
        serde_json::Value::Array(items) => items.iter().find_map(extract_price_permissive),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_symbols_normalize_to_underlying() {
        assert_eq!(normalize_symbol("WBTC"), "BTC");
        assert_eq!(normalize_symbol("TBTC"), "BTC");
        assert_eq!(normalize_symbol("BTC"), "BTC");
        assert_eq!(normalize_symbol("wbtc"), "BTC");
        assert_eq!(normalize_symbol("WETH"), "ETH");
        assert_eq!(normalize_symbol("WSOL"), "SOL");
        assert_eq!(normalize_symbol("USDC"), "USDC");
    }

    #[tokio::test]
    async fn stablecoins_short_circuit_without_providers() {
        // no providers configured at all: a network call would fail
        let client = PriceClient::new(vec![], RetryPolicy::default()).unwrap();
        assert_eq!(client.get_usd_price("USDT").await.unwrap(), 1.0);
        assert_eq!(client.get_usd_price("usdc").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_normalized_symbol() {
        let client = PriceClient::new(vec![], RetryPolicy::default()).unwrap();
        // Seed the cache under the normalized key, then look up via an alias.
        client
            .cache
            .insert("BTC".to_string(), (50_000.0, Instant::now()));
        assert_eq!(client.get_usd_price("WBTC").await.unwrap(), 50_000.0);
        assert_eq!(client.get_usd_price("TBTC").await.unwrap(), 50_000.0);
    }

    #[test]
    fn permissive_extraction_digs_into_nested_objects() {
        let raw = serde_json::json!({"data": {"last": "50123.45"}});
        assert_eq!(extract_price_permissive(&raw), Some(50_123.45));

        let raw = serde_json::json!({"ok": true});
        assert_eq!(extract_price_permissive(&raw), None);
    }
}
