//! In-process bus.
//!
//! Implements the full [`Bus`] contract over process-local channels: exact
//! subject fanout, request-reply via generated reply inboxes, and ephemeral
//! KV with current-value delivery on attach. Used by the test suites and by
//! standalone streamable mode, where no control plane exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Bus, BusError, BusMessage, Subscription, SubscriptionHandle};

/// Per-subscriber channel capacity. Slow consumers lose messages rather
/// than stalling publishers.
const CHANNEL_CAPACITY: usize = 64;

struct SubEntry {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

struct Inner {
    // Lock order: `kv` before `subs` (kv_put and kv_watch take both).
    kv: Mutex<HashMap<String, Vec<u8>>>,
    subs: Mutex<HashMap<String, Vec<SubEntry>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn fanout(&self, subject: &str, payload: &[u8], reply: Option<&str>) {
        let subs = self.subs.lock();
        let Some(entries) = subs.get(subject) else {
            return;
        };
        for entry in entries {
            let msg = BusMessage {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                reply: reply.map(str::to_string),
            };
            if entry.tx.try_send(msg).is_err() {
                tracing::warn!(subject, sub_id = entry.id, "subscriber lagging, message dropped");
            }
        }
    }

    fn remove_sub(&self, subject: &str, id: u64) {
        let mut subs = self.subs.lock();
        if let Some(entries) = subs.get_mut(subject) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                subs.remove(subject);
            }
        }
    }
}

/// In-process [`Bus`] implementation.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                kv: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live subscriptions on a subject (test observability).
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subs
            .lock()
            .get(subject)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    fn add_subscription(&self, subject: &str) -> (Subscription, mpsc::Sender<BusMessage>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.inner
            .subs
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(SubEntry { id, tx: tx.clone() });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let close_subject = subject.to_string();
        let handle = SubscriptionHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_sub(&close_subject, id);
            }
        });

        (Subscription::new(subject.to_string(), rx, handle), tx)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.inner.fanout(subject, &payload, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (sub, _tx) = self.add_subscription(subject);
        Ok(sub)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4());
        let (mut reply_sub, _tx) = self.add_subscription(&inbox);
        self.inner.fanout(subject, &payload, Some(&inbox));

        match tokio::time::timeout(timeout, reply_sub.next()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<(), BusError> {
        let subject = kv_subject(key);
        {
            let mut kv = self.inner.kv.lock();
            kv.insert(key.to_string(), value.clone());
        }
        self.inner.fanout(&subject, &value, None);
        Ok(())
    }

    async fn kv_watch(&self, key: &str) -> Result<Subscription, BusError> {
        let subject = kv_subject(key);

        // Hold the kv lock across attach so the initial value and the fanout
        // of a concurrent put cannot arrive out of order. The current value
        // goes to the new watcher only, not to everyone on the subject.
        let kv = self.inner.kv.lock();
        let (sub, tx) = self.add_subscription(&subject);
        if let Some(current) = kv.get(key) {
            let _ = tx.try_send(BusMessage {
                subject: subject.clone(),
                payload: current.clone(),
                reply: None,
            });
        }
        drop(kv);

        Ok(sub)
    }
}

fn kv_subject(key: &str) -> String {
    format!("$KV.{key}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
