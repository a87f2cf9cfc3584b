//! The bus seam.
//!
//! The runtime talks to the central messaging bus exclusively through the
//! [`Bus`] trait: publish/subscribe, request-reply, and ephemeral key-value
//! watch. The production bus client is wired in at assembly; tests and
//! standalone mode use the in-process [`MemoryBus`], which implements the
//! same contract (including current-value delivery on KV attach).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

mod memory;
pub mod subjects;

pub use memory::MemoryBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages & errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Reply inbox, set when the sender used request-reply.
    pub reply: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("timeout waiting for reply on {0}")]
    Timeout(String),

    #[error("bus connection closed")]
    Closed,

    #[error("bus: {0}")]
    Other(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cloneable handle that tears down one subscription. Closing twice is a
/// no-op, as is closing after the bus itself is gone.
#[derive(Clone)]
pub struct SubscriptionHandle {
    closer: std::sync::Arc<dyn Fn() + Send + Sync>,
}

impl SubscriptionHandle {
    pub fn new(closer: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            closer: std::sync::Arc::new(closer),
        }
    }

    pub fn close(&self) {
        (self.closer)();
    }
}

/// A live subscription. Messages arrive via [`Subscription::next`]; dropping
/// the subscription (or closing its handle) removes it from the bus.
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<BusMessage>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(
        subject: String,
        receiver: mpsc::Receiver<BusMessage>,
        handle: SubscriptionHandle,
    ) -> Self {
        Self {
            subject,
            receiver,
            handle,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// A handle that closes this subscription; safe to store in tables.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to an exact subject.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Request-reply: publish with a reply inbox and await the first reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    /// Write an ephemeral KV entry (and notify watchers).
    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<(), BusError>;

    /// Watch an ephemeral KV key. The current value (if any) is delivered
    /// immediately on attach, then every subsequent write.
    async fn kv_watch(&self, key: &str) -> Result<Subscription, BusError>;
}

/// Request with at most one retry on timeout.
///
/// Covers the narrow window between a toolset becoming routable on the
/// control plane and a call arriving. The contract is exactly one retry:
/// no backoff, no further attempts.
pub async fn request_with_retry(
    bus: &dyn Bus,
    subject: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, BusError> {
    match bus.request(subject, payload.clone(), timeout).await {
        Err(BusError::Timeout(_)) => {
            tracing::debug!(subject, "bus request timed out, retrying once");
            bus.request(subject, payload, timeout).await
        }
        other => other,
    }
}
