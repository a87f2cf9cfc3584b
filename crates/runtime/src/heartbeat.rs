//! Presence heartbeat.
//!
//! A periodic beacon tied to the process identity, plus a single `kill`
//! frame on clean shutdown so the control plane can distinguish a crash
//! from an orderly exit.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tm_bus::{subjects, Bus};
use tm_wire::{Heartbeat, Kill};

use crate::identity::RuntimeIdentity;

pub struct HeartbeatTask {
    bus: Arc<dyn Bus>,
    identity_id: String,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatTask {
    /// Start the beacon loop. The first beat is published immediately.
    pub fn start(bus: Arc<dyn Bus>, identity: &RuntimeIdentity, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let subject = subjects::heartbeat(&identity.id);

        let beat = Heartbeat::now(
            &identity.id,
            identity.pid,
            &identity.hostname,
            &identity.version,
        );
        let bus_for_task = bus.clone();
        let cancel_for_task = cancel.clone();
        let identity_id = identity.id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = Heartbeat { timestamp_ms: chrono::Utc::now().timestamp_millis(), ..beat.clone() };
                        let payload = match serde_json::to_vec(&frame) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to serialize heartbeat");
                                continue;
                            }
                        };
                        if let Err(e) = bus_for_task.publish(&subject, payload).await {
                            tracing::warn!(error = %e, "heartbeat publish failed");
                        }
                    }
                    _ = cancel_for_task.cancelled() => {
                        tracing::debug!(identity_id = %identity_id, "heartbeat loop cancelled");
                        break;
                    }
                }
            }
        });

        Self {
            bus,
            identity_id: identity.id.clone(),
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Cancel the loop and publish the kill frame.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
        let kill = Kill::now(&self.identity_id);
        match serde_json::to_vec(&kill) {
            Ok(payload) => {
                if let Err(e) = self
                    .bus
                    .publish(&subjects::kill(&self.identity_id), payload)
                    .await
                {
                    tracing::warn!(error = %e, "kill frame publish failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize kill frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_bus::MemoryBus;
    use tm_wire::IdentityNature;

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity {
            id: "0xR".into(),
            workspace_id: "0xW".into(),
            name: "edge".into(),
            nature: IdentityNature::Runtime,
            version: "0.1.0".into(),
            pid: 42,
            host_ip: "10.0.0.1".into(),
            hostname: "edge-1".into(),
            platform: "linux".into(),
        }
    }

    #[tokio::test]
    async fn beats_then_kills() {
        let bus = MemoryBus::new();
        let mut beats = bus.subscribe(&subjects::heartbeat("0xR")).await.unwrap();
        let mut kills = bus.subscribe(&subjects::kill("0xR")).await.unwrap();

        let heartbeat = HeartbeatTask::start(
            Arc::new(bus.clone()),
            &identity(),
            Duration::from_millis(20),
        );

        let frame: Heartbeat = serde_json::from_slice(&beats.next().await.unwrap().payload).unwrap();
        assert_eq!(frame.id, "0xR");
        assert_eq!(frame.pid, 42);

        heartbeat.shutdown().await;
        let kill: Kill = serde_json::from_slice(&kills.next().await.unwrap().payload).unwrap();
        assert_eq!(kill.id, "0xR");
    }
}
