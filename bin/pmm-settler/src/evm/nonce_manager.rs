//! Per-network EVM nonce cache.
//!
//! One slot per network id, lazily initialized from the chain's pending
//! transaction count. All access goes through this type; the slot mutex
//! enforces the single-writer refresh-then-read discipline. A background loop
//! resyncs every slot periodically so external sends from the same key cannot
//! drift the cache forever.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider};
use dashmap::DashMap;
use snafu::Snafu;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum NonceError {
    #[snafu(display("No provider registered for network {network_id}"))]
    NetworkNotRegistered { network_id: String },

    #[snafu(display("Failed to fetch pending nonce for network {network_id}: {source}"))]
    FetchNonce {
        network_id: String,
        source: alloy::transports::RpcError<alloy::transports::TransportErrorKind>,
    },
}

pub type Result<T, E = NonceError> = std::result::Result<T, E>;

struct NetworkSlot {
    provider: DynProvider,
    /// Next nonce to hand out; `None` until first use or after an
    /// invalidation.
    next: Mutex<Option<u64>>,
}

pub struct NonceManager {
    sender: Address,
    slots: DashMap<String, Arc<NetworkSlot>>,
}

impl NonceManager {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            slots: DashMap::new(),
        }
    }

    pub fn register_network(&self, network_id: &str, provider: DynProvider) {
        self.slots.insert(
            network_id.to_string(),
            Arc::new(NetworkSlot {
                provider,
                next: Mutex::new(None),
            }),
        );
    }

    fn slot(&self, network_id: &str) -> Result<Arc<NetworkSlot>> {
        self.slots
            .get(network_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| NonceError::NetworkNotRegistered {
                network_id: network_id.to_string(),
            })
    }

    /// Hand out the next nonce for `network_id` and advance the cache.
    pub async fn reserve_nonce(&self, network_id: &str) -> Result<u64> {
        let slot = self.slot(network_id)?;
        let mut guard = slot.next.lock().await;

        let nonce = match *guard {
            Some(n) => n,
            None => {
                let fresh = fetch_pending_nonce(&slot.provider, self.sender, network_id).await?;
                debug!(network_id, nonce = fresh, "nonce cache initialized");
                fresh
            }
        };
        *guard = Some(nonce + 1);
        Ok(nonce)
    }

    /// Drop the cached value and resync from the chain. Called by the
    /// executor whenever a submission fails with a nonce-class error.
    pub async fn force_refresh(&self, network_id: &str) -> Result<u64> {
        let slot = self.slot(network_id)?;
        let mut guard = slot.next.lock().await;
        let fresh = fetch_pending_nonce(&slot.provider, self.sender, network_id).await?;
        info!(network_id, nonce = fresh, "nonce cache force-refreshed");
        *guard = Some(fresh);
        Ok(fresh)
    }

    /// Resync every registered network, tolerating individual failures.
    pub async fn refresh_all(&self) {
        let network_ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for network_id in network_ids {
            if let Err(e) = self.force_refresh(&network_id).await {
                warn!(network_id, error = %e, "periodic nonce refresh failed");
            }
        }
    }

    /// Periodic resync against untracked external sends.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        join_set: &mut JoinSet<crate::Result<()>>,
    ) {
        let this = Arc::clone(self);
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.refresh_all().await;
            }
        });
    }
}

async fn fetch_pending_nonce(
    provider: &DynProvider,
    sender: Address,
    network_id: &str,
) -> Result<u64> {
    provider
        .get_transaction_count(sender)
        .pending()
        .await
        .map_err(|source| NonceError::FetchNonce {
            network_id: network_id.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_network_is_an_error() {
        let manager = NonceManager::new(Address::ZERO);
        let err = manager.reserve_nonce("8453").await.unwrap_err();
        assert!(matches!(err, NonceError::NetworkNotRegistered { .. }));
    }
}
