//! Transport-agnostic MCP session core.
//!
//! One [`McpSession`] per consumer connection, regardless of transport. The
//! transports deliver JSON-RPC frames; the session answers requests, swallows
//! notifications and responses, and gates `initialize` on the first catalog
//! snapshot so a client never sees an empty toolset by accident.

use std::sync::Arc;

use serde_json::Value;

use tm_domain::Error;

use crate::view::{SessionIdentity, SessionToolsetView};

/// Protocol version answered to `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// Advertised server version.
pub const SERVER_VERSION: &str = "1.0.0";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What kind of JSON-RPC frame a body is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Notification,
    Response,
}

pub fn frame_kind(frame: &Value) -> FrameKind {
    match (frame.get("method").is_some(), frame.get("id").is_some()) {
        (true, true) => FrameKind::Request,
        (true, false) => FrameKind::Notification,
        (false, _) => FrameKind::Response,
    }
}

pub fn is_initialize_request(frame: &Value) -> bool {
    frame_kind(frame) == FrameKind::Request
        && frame.get("method").and_then(Value::as_str) == Some("initialize")
}

pub fn result_response(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// The `notifications/tools/list_changed` push frame.
pub fn list_changed_notification() -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Initializing,
    Ready,
    Closing,
    Closed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpSession {
    pub id: String,
    identity: SessionIdentity,
    view: Arc<SessionToolsetView>,
    state: parking_lot::Mutex<SessionState>,
    client_info: parking_lot::Mutex<Option<Value>>,
}

impl McpSession {
    pub fn new(id: String, identity: SessionIdentity, view: Arc<SessionToolsetView>) -> Self {
        Self {
            id,
            identity,
            view,
            state: parking_lot::Mutex::new(SessionState::Opening),
            client_info: parking_lot::Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn view(&self) -> &Arc<SessionToolsetView> {
        &self.view
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        tracing::debug!(session_id = %self.id, from = ?*state, to = ?next, "session state");
        *state = next;
    }

    /// Mark the session as tearing down and release the view.
    pub fn close(&self) {
        self.set_state(SessionState::Closing);
        self.view.close();
        self.set_state(SessionState::Closed);
    }

    /// Handle one inbound frame. Requests produce a response frame;
    /// notifications and client responses produce nothing.
    pub async fn handle_frame(&self, frame: Value) -> Option<Value> {
        match frame_kind(&frame) {
            FrameKind::Response => {
                tracing::debug!(session_id = %self.id, "ignoring client response frame");
                None
            }
            FrameKind::Notification => {
                let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
                tracing::debug!(session_id = %self.id, method, "client notification");
                None
            }
            FrameKind::Request => {
                let id = frame.get("id").cloned().unwrap_or(Value::Null);
                let method = frame
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let params = frame.get("params").cloned();
                Some(self.handle_request(id, &method, params).await)
            }
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: Option<Value>) -> Value {
        match method {
            "initialize" => self.handle_initialize(id, params).await,
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params).await,
            "ping" => result_response(id, serde_json::json!({})),
            _ => error_response(id, -32601, &format!("Method not found: {method}")),
        }
    }

    /// Record client info and reply only after the toolset view has its
    /// first catalog snapshot.
    async fn handle_initialize(&self, id: Value, params: Option<Value>) -> Value {
        self.set_state(SessionState::Initializing);

        if let Some(info) = params.as_ref().and_then(|p| p.get("clientInfo")) {
            tracing::info!(
                session_id = %self.id,
                client = %info.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                "client connected"
            );
            *self.client_info.lock() = Some(info.clone());
        }

        self.view.wait_for_tools().await;
        self.set_state(SessionState::Ready);

        result_response(
            id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": {
                    "name": self.identity.name,
                    "version": SERVER_VERSION,
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Value) -> Value {
        let tools: Vec<Value> = self
            .view
            .projected_tools()
            .iter()
            .map(|t| t.to_json())
            .collect();
        result_response(id, serde_json::json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> Value {
        let Some(params) = params else {
            return error_response(id, -32602, "Missing params for tools/call");
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, -32602, "Missing tool name");
        };
        let Some(arguments) = params.get("arguments") else {
            return error_response(id, -32602, "Missing arguments");
        };

        match self.view.call_tool(name, arguments.clone()).await {
            Ok(result) => result_response(id, result),
            Err(Error::ToolNotFound(name)) => {
                error_response(id, -32602, &format!("Unknown tool: {name}"))
            }
            Err(e) => error_response(id, -32603, &e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
