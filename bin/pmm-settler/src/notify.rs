//! Operator notification seam. Delivery (Telegram or otherwise) is a
//! collaborator; everything here is best-effort and must never fail a
//! settlement path.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a human-readable operator message. Implementations swallow
    /// their own failures.
    async fn send_message(&self, text: &str);
}

/// Fallback notifier: operator messages land in the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, text: &str) {
        warn!(target: "operator", "{text}");
    }
}
