//! Consumer session management.
//!
//! One session per consumer connection, each fully independent: its own
//! authentication handshake, its own toolset view, its own transport. The
//! manager owns the session map; entries are registered partially populated
//! and completed by mutation of the same record, so concurrent lookups
//! always see a valid pointer and tolerate the not-yet-filled fields.

pub mod mcp;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use tm_bus::Bus;
use tm_domain::{Error, Result};
use tm_wire::IdentityNature;

use crate::identity::{handshake_on, validate_credentials};
use crate::sessions::mcp::{list_changed_notification, McpSession};
use crate::view::{SessionIdentity, SessionToolsetView};

/// Outbound frame buffer per session (SSE stream backlog).
const OUTBOUND_CAPACITY: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth headers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Credential headers recognized on HTTP transports (case-insensitive).
#[derive(Debug, Clone, Default)]
pub struct AuthHeaders {
    pub master_key: Option<String>,
    pub toolset_key: Option<String>,
    pub toolset_name: Option<String>,
    pub skill_key: Option<String>,
}

impl AuthHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            master_key: get("master_key"),
            toolset_key: get("toolset_key"),
            toolset_name: get("toolset_name"),
            skill_key: get("skill_key"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFlavor {
    Sse,
    Streamable,
}

/// One registered session. `mcp` starts out `None` (the record is inserted
/// into the map before the view attaches) and is filled by mutation; it is
/// never replaced with a new record.
pub struct SessionEntry {
    pub id: String,
    pub flavor: TransportFlavor,
    mcp: RwLock<Option<Arc<McpSession>>>,
    outbound_tx: mpsc::Sender<Value>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Value>>>,
    notify_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionEntry {
    /// The session core, once the entry is completed. Callers must tolerate
    /// `None` during the construction window.
    pub fn session(&self) -> Option<Arc<McpSession>> {
        self.mcp.read().clone()
    }

    /// Queue a frame for the session's server→client stream.
    pub fn outbound(&self) -> mpsc::Sender<Value> {
        self.outbound_tx.clone()
    }

    /// Take the server→client stream receiver. Yields `Some` exactly once.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Value>> {
        self.outbound_rx.lock().take()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    bus: Arc<dyn Bus>,
    call_timeout: Duration,
    /// When false (standalone streamable mode), sessions are admitted
    /// without a handshake under a default identity.
    enforce_auth: bool,
    default_workspace: String,
    default_toolset: String,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionManager {
    pub fn new(
        bus: Arc<dyn Bus>,
        call_timeout: Duration,
        enforce_auth: bool,
        default_workspace: String,
        default_toolset: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            call_timeout,
            enforce_auth,
            default_workspace,
            default_toolset,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    /// Authenticate one session from its credential headers: validate the
    /// combination, then handshake with the control plane (5 s, no retry).
    pub async fn authenticate(&self, headers: &AuthHeaders) -> Result<SessionIdentity> {
        if !self.enforce_auth {
            return Ok(SessionIdentity {
                workspace_id: self.default_workspace.clone(),
                target_id: self.default_toolset.clone(),
                name: self.default_toolset.clone(),
                skill_mode: false,
            });
        }

        if let Some(skill_key) = &headers.skill_key {
            if headers.master_key.is_some() || headers.toolset_key.is_some() {
                return Err(Error::AuthFailed(
                    "a skill key cannot be combined with other credentials".into(),
                ));
            }
            let ok = handshake_on(self.bus.as_ref(), skill_key, IdentityNature::Skill, None).await?;
            return Ok(SessionIdentity {
                workspace_id: ok.workspace_id,
                target_id: ok.id,
                name: ok.name,
                skill_mode: true,
            });
        }

        validate_credentials(
            headers.master_key.as_deref(),
            headers.toolset_key.as_deref(),
            headers.toolset_name.as_deref(),
        )?;

        let key = headers
            .master_key
            .as_deref()
            .or(headers.toolset_key.as_deref())
            .unwrap_or_default();
        let ok = handshake_on(
            self.bus.as_ref(),
            key,
            IdentityNature::Toolset,
            headers.toolset_name.as_deref(),
        )
        .await?;

        Ok(SessionIdentity {
            workspace_id: ok.workspace_id,
            target_id: ok.id,
            name: ok.name,
            skill_mode: false,
        })
    }

    /// Open a session: register a partial entry under a fresh server-issued
    /// id, attach the toolset view, then complete the entry in place and
    /// start its list-changed pump.
    pub async fn open_session(
        &self,
        flavor: TransportFlavor,
        identity: SessionIdentity,
    ) -> Result<Arc<SessionEntry>> {
        let id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            flavor,
            mcp: RwLock::new(None),
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            notify_task: parking_lot::Mutex::new(None),
        });
        self.sessions.write().insert(id.clone(), entry.clone());

        let view = match SessionToolsetView::new(self.bus.clone(), identity.clone(), self.call_timeout)
            .await
        {
            Ok(view) => Arc::new(view),
            Err(e) => {
                self.sessions.write().remove(&id);
                return Err(e);
            }
        };

        let mcp = Arc::new(McpSession::new(id.clone(), identity, view.clone()));
        *entry.mcp.write() = Some(mcp);

        // List-changed pump: every catalog emission becomes a notification
        // frame on the session's outbound stream.
        let tx = entry.outbound();
        let mut changes = view
            .take_changes()
            .ok_or_else(|| Error::SessionInvalid("view change stream already taken".into()))?;
        let session_id = id.clone();
        let task = tokio::spawn(async move {
            while changes.recv().await.is_some() {
                if tx.send(list_changed_notification()).await.is_err() {
                    break;
                }
                tracing::debug!(session_id = %session_id, "pushed tools/list_changed");
            }
        });
        *entry.notify_task.lock() = Some(task);

        tracing::info!(session_id = %id, flavor = ?flavor, "session opened");
        Ok(entry)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close one session: remove it from the map, stop its list-changed
    /// pump, and release its view (which unsubscribes the catalog watch).
    pub fn close_session(&self, session_id: &str) {
        let Some(entry) = self.sessions.write().remove(session_id) else {
            return;
        };
        if let Some(task) = entry.notify_task.lock().take() {
            task.abort();
        }
        if let Some(session) = entry.session() {
            session.close();
        }
        tracing::info!(session_id = %session_id, "session closed");
    }

    /// Close everything (shutdown path). Individual failures cannot occur
    /// here, but the loop is tolerant of half-built entries.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.close_session(&id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tm_bus::{subjects, MemoryBus};
    use tm_wire::{CatalogSnapshot, HandshakeRequest, HandshakeResponse};

    fn manager(bus: &MemoryBus, enforce_auth: bool) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(bus.clone()),
            Duration::from_millis(200),
            enforce_auth,
            "0xW".into(),
            "standalone".into(),
        )
    }

    fn spawn_control_plane(bus: &MemoryBus) {
        let bus_for_task = bus.clone();
        tokio::spawn(async move {
            let mut sub = bus_for_task.subscribe(subjects::HANDSHAKE).await.unwrap();
            while let Some(msg) = sub.next().await {
                let req: HandshakeRequest = serde_json::from_slice(&msg.payload).unwrap();
                let response = if req.key == "M" {
                    HandshakeResponse::Ok {
                        id: "0xA".into(),
                        workspace_id: "0xW".into(),
                        name: req.name.unwrap_or_default(),
                        access_token: None,
                        bus_jwt: None,
                    }
                } else {
                    HandshakeResponse::Error {
                        message: "unknown key".into(),
                    }
                };
                if let Some(reply) = msg.reply {
                    bus_for_task
                        .publish(&reply, serde_json::to_vec(&response).unwrap())
                        .await
                        .unwrap();
                }
            }
        });
    }

    async fn put_empty_catalog(bus: &MemoryBus, workspace: &str, toolset: &str) {
        bus.kv_put(
            &subjects::toolset_catalog(workspace, toolset),
            serde_json::to_vec(&CatalogSnapshot::default()).unwrap(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn authenticate_via_master_key() {
        let bus = MemoryBus::new();
        spawn_control_plane(&bus);
        let manager = manager(&bus, true);

        let identity = manager
            .authenticate(&AuthHeaders {
                master_key: Some("M".into()),
                toolset_name: Some("T".into()),
                ..AuthHeaders::default()
            })
            .await
            .unwrap();
        assert_eq!(identity.target_id, "0xA");
        assert_eq!(identity.workspace_id, "0xW");
        assert_eq!(identity.name, "T");
        assert!(!identity.skill_mode);
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_combinations() {
        let bus = MemoryBus::new();
        let manager = manager(&bus, true);

        // Master key without a toolset name.
        let err = manager
            .authenticate(&AuthHeaders {
                master_key: Some("M".into()),
                ..AuthHeaders::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));

        // No credentials at all.
        let err = manager.authenticate(&AuthHeaders::default()).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
    }

    #[tokio::test]
    async fn standalone_mode_skips_the_handshake() {
        let bus = MemoryBus::new();
        // No control plane responder: a handshake would time out.
        let manager = manager(&bus, false);
        let identity = manager.authenticate(&AuthHeaders::default()).await.unwrap();
        assert_eq!(identity.workspace_id, "0xW");
        assert_eq!(identity.target_id, "standalone");
    }

    #[tokio::test]
    async fn open_session_registers_then_completes_the_same_entry() {
        let bus = MemoryBus::new();
        put_empty_catalog(&bus, "0xW", "0xT").await;
        let manager = manager(&bus, false);

        let identity = SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xT".into(),
            name: "main".into(),
            skill_mode: false,
        };
        let entry = manager
            .open_session(TransportFlavor::Streamable, identity)
            .await
            .unwrap();

        // The registered record is the same object that got completed.
        let looked_up = manager.get(&entry.id).unwrap();
        assert!(Arc::ptr_eq(&entry, &looked_up));
        assert!(looked_up.session().is_some());
    }

    #[tokio::test]
    async fn list_changed_fires_on_catalog_updates() {
        let bus = MemoryBus::new();
        put_empty_catalog(&bus, "0xW", "0xT").await;
        let manager = manager(&bus, false);

        let identity = SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xT".into(),
            name: "main".into(),
            skill_mode: false,
        };
        let entry = manager
            .open_session(TransportFlavor::Sse, identity)
            .await
            .unwrap();
        let mut outbound = entry.take_outbound().unwrap();

        // A new catalog publish must surface as a list_changed frame.
        put_empty_catalog(&bus, "0xW", "0xT").await;
        let frame = outbound.recv().await.unwrap();
        assert_eq!(frame["method"], "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn close_session_removes_map_entry_and_watch() {
        let bus = MemoryBus::new();
        put_empty_catalog(&bus, "0xW", "0xT").await;
        let manager = manager(&bus, false);

        let identity = SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xT".into(),
            name: "main".into(),
            skill_mode: false,
        };
        let entry = manager
            .open_session(TransportFlavor::Streamable, identity)
            .await
            .unwrap();
        let watch_subject = format!("$KV.{}", subjects::toolset_catalog("0xW", "0xT"));
        assert_eq!(bus.subscriber_count(&watch_subject), 1);

        manager.close_session(&entry.id);
        assert!(manager.get(&entry.id).is_none());
        assert_eq!(bus.subscriber_count(&watch_subject), 0);

        // Closing an unknown session is a no-op.
        manager.close_session(&entry.id);
    }
}
