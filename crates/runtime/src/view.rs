//! Per-session toolset view.
//!
//! Each consumer session watches the bus-published catalog for its toolset
//! (or skill), projects the catalog into MCP tool listings, and turns the
//! client's `tools/call` into bus request-reply messages addressed by tool
//! or skill id. The control plane resolves routing from there.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use tm_bus::{request_with_retry, subjects, Bus, SubscriptionHandle};
use tm_domain::{Error, Result};
use tm_wire::{CallToolRequest, CallToolResponse, CatalogSnapshot};

/// The synthetic tool injected first into every skill-as-server catalog.
pub const INIT_SKILL: &str = "init_skill";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & projection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who a session is: one toolset or one skill in one workspace. Set once at
/// authentication and never mutated until the session closes.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub workspace_id: String,
    /// Toolset id, or skill id in skill-as-server mode.
    pub target_id: String,
    pub name: String,
    pub skill_mode: bool,
}

/// A catalog tool with its JSON-string fields parsed, ready to present to
/// an MCP client.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Value,
}

impl ProjectedTool {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "annotations": self.annotations,
        })
    }
}

fn init_skill_tool() -> ProjectedTool {
    ProjectedTool {
        name: INIT_SKILL.into(),
        description: "Initialize the skill and return its description.".into(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": { "original_prompt": { "type": "string" } }
        }),
        annotations: serde_json::json!({}),
    }
}

fn parse_json_or(raw: &str, fallback: Value) -> Value {
    if raw.is_empty() {
        return fallback;
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable catalog JSON field, using fallback");
            fallback
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// View
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionToolsetView {
    bus: Arc<dyn Bus>,
    identity: SessionIdentity,
    call_timeout: Duration,
    snapshot_rx: watch::Receiver<Option<CatalogSnapshot>>,
    /// One signal per catalog arrival (not coalesced); feeds the session's
    /// list_changed pump.
    changes_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::Receiver<()>>>,
    sub_handle: SubscriptionHandle,
    watch_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionToolsetView {
    /// Attach the KV watch for this session's catalog. The current catalog
    /// (if any) arrives immediately.
    pub async fn new(
        bus: Arc<dyn Bus>,
        identity: SessionIdentity,
        call_timeout: Duration,
    ) -> Result<Self> {
        let subject = if identity.skill_mode {
            subjects::skill_catalog(&identity.workspace_id, &identity.target_id)
        } else {
            subjects::toolset_catalog(&identity.workspace_id, &identity.target_id)
        };

        let mut sub = bus
            .kv_watch(&subject)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        let sub_handle = sub.handle();

        let (tx, snapshot_rx) = watch::channel(None);
        let (changes_tx, changes_rx) = tokio::sync::mpsc::channel(32);
        let subject_for_task = subject.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<CatalogSnapshot>(&msg.payload) {
                    Ok(snapshot) => {
                        tx.send_replace(Some(snapshot));
                        if changes_tx.try_send(()).is_err() {
                            tracing::debug!(
                                subject = %subject_for_task,
                                "change stream backlogged, signal dropped"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            subject = %subject_for_task,
                            error = %e,
                            "undecodable catalog snapshot"
                        );
                    }
                }
            }
        });

        tracing::debug!(subject = %subject, "toolset view attached");

        Ok(Self {
            bus,
            identity,
            call_timeout,
            snapshot_rx,
            changes_rx: parking_lot::Mutex::new(Some(changes_rx)),
            sub_handle,
            watch_task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// Take the per-arrival change stream (one `()` per catalog emission,
    /// the initial delivery included). Yields `Some` exactly once.
    pub fn take_changes(&self) -> Option<tokio::sync::mpsc::Receiver<()>> {
        self.changes_rx.lock().take()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// The latest catalog, if one has arrived.
    pub fn current(&self) -> Option<CatalogSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Observable catalog stream: current value on attach, then changes.
    pub fn snapshots(&self) -> watch::Receiver<Option<CatalogSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Suspend until the first catalog snapshot arrives.
    pub async fn wait_for_tools(&self) -> CatalogSnapshot {
        let mut rx = self.snapshot_rx.clone();
        loop {
            if let Some(snapshot) = rx.borrow_and_update().clone() {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                return CatalogSnapshot::default();
            }
        }
    }

    /// Project the catalog for an MCP client: `init_skill` first, then the
    /// catalog tools with their JSON-string fields parsed. A smart-skill
    /// catalog collapses to `[init_skill, the skill tool]` no matter what
    /// else it carries.
    pub fn projected_tools(&self) -> Vec<ProjectedTool> {
        let snapshot = self.current().unwrap_or_default();

        if let Some(skill_tool) = &snapshot.smart_skill_tool {
            return vec![
                init_skill_tool(),
                ProjectedTool {
                    name: skill_tool.name.clone(),
                    description: skill_tool.description.clone(),
                    // Smart skills take one message; the schema is implicit.
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": { "message": { "type": "string" } },
                        "required": ["message"]
                    }),
                    annotations: parse_json_or(&skill_tool.annotations, serde_json::json!({})),
                },
            ];
        }

        let mut tools = vec![init_skill_tool()];
        for tool in &snapshot.tools {
            tools.push(ProjectedTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: parse_json_or(
                    &tool.input_schema,
                    serde_json::json!({ "type": "object" }),
                ),
                annotations: parse_json_or(&tool.annotations, serde_json::json!({})),
            });
        }
        tools
    }

    /// Call a tool by its client-visible name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let snapshot = self.current().unwrap_or_default();

        // The synthetic init_skill never touches the bus.
        if name == INIT_SKILL {
            let description = snapshot.description.unwrap_or_default();
            return Ok(serde_json::json!({
                "content": [{ "type": "text", "text": description }]
            }));
        }

        if let Some(skill_tool) = &snapshot.smart_skill_tool {
            if skill_tool.name == name {
                let request = CallToolRequest::SmartSkill {
                    skill_id: self.identity.target_id.clone(),
                    arguments,
                };
                let subject = subjects::call_tool_global(&self.identity.target_id);
                return self.request_call(&subject, &request).await;
            }
        }

        let tool = snapshot
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        let request = CallToolRequest::McpTool {
            tool_id: tool.id.clone(),
            arguments,
        };
        let subject = subjects::call_tool_global(&tool.id);
        self.request_call(&subject, &request).await
    }

    async fn request_call(&self, subject: &str, request: &CallToolRequest) -> Result<Value> {
        let payload = serde_json::to_vec(request)?;
        let raw = request_with_retry(self.bus.as_ref(), subject, payload, self.call_timeout)
            .await
            .map_err(|e| Error::CallFailed(e.to_string()))?;
        let response: CallToolResponse = serde_json::from_slice(&raw)
            .map_err(|e| Error::CallFailed(format!("undecodable call response: {e}")))?;
        match response {
            CallToolResponse::Success { result, .. } => Ok(result),
            CallToolResponse::Error { message } => Err(Error::CallFailed(message)),
        }
    }

    /// Tear down the bus watch. Idempotent.
    pub fn close(&self) {
        self.sub_handle.close();
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SessionToolsetView {
    fn drop(&mut self) {
        self.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tm_bus::MemoryBus;
    use tm_wire::CatalogTool;

    fn toolset_identity() -> SessionIdentity {
        SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xT".into(),
            name: "main".into(),
            skill_mode: false,
        }
    }

    fn skill_identity() -> SessionIdentity {
        SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xS".into(),
            name: "summarizer".into(),
            skill_mode: true,
        }
    }

    fn echo_catalog() -> CatalogSnapshot {
        CatalogSnapshot {
            description: None,
            smart_skill_tool: None,
            tools: vec![CatalogTool {
                id: "0xE".into(),
                name: "echo".into(),
                description: "Echo back".into(),
                input_schema: r#"{"type":"object"}"#.into(),
                annotations: "{}".into(),
            }],
        }
    }

    async fn put_catalog(bus: &MemoryBus, identity: &SessionIdentity, snapshot: &CatalogSnapshot) {
        let subject = if identity.skill_mode {
            subjects::skill_catalog(&identity.workspace_id, &identity.target_id)
        } else {
            subjects::toolset_catalog(&identity.workspace_id, &identity.target_id)
        };
        bus.kv_put(&subject, serde_json::to_vec(snapshot).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_snapshot_arrives_on_attach() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        let snapshot = view.wait_for_tools().await;
        assert_eq!(snapshot.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn projection_parses_schema_strings() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let tools = view.projected_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, INIT_SKILL);
        assert_eq!(tools[1].input_schema["type"], "object");
        assert_eq!(tools[1].annotations, serde_json::json!({}));
    }

    #[tokio::test]
    async fn skill_mode_prepends_init_skill() {
        let bus = MemoryBus::new();
        let identity = skill_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let tools = view.projected_tools();
        assert_eq!(tools[0].name, INIT_SKILL);
        assert_eq!(tools[1].name, "echo");
    }

    #[tokio::test]
    async fn smart_skill_catalog_collapses_to_two_tools() {
        let bus = MemoryBus::new();
        let identity = skill_identity();
        let snapshot = CatalogSnapshot {
            description: Some("summarizes things".into()),
            smart_skill_tool: Some(CatalogTool {
                id: "0xS".into(),
                name: "summarize".into(),
                description: "Summarize text".into(),
                input_schema: String::new(),
                annotations: String::new(),
            }),
            // Extra MCP tools in the same snapshot must be hidden.
            tools: vec![CatalogTool {
                id: "0xE".into(),
                name: "echo".into(),
                description: String::new(),
                input_schema: String::new(),
                annotations: String::new(),
            }],
        };
        put_catalog(&bus, &identity, &snapshot).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let tools = view.projected_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, INIT_SKILL);
        assert_eq!(tools[1].name, "summarize");
        assert_eq!(tools[1].input_schema["properties"]["message"]["type"], "string");
    }

    #[tokio::test]
    async fn init_skill_short_circuits_without_bus_traffic() {
        let bus = MemoryBus::new();
        let identity = skill_identity();
        let snapshot = CatalogSnapshot {
            description: Some("hello".into()),
            ..CatalogSnapshot::default()
        };
        put_catalog(&bus, &identity, &snapshot).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_millis(20))
            .await
            .unwrap();
        view.wait_for_tools().await;

        // No responder anywhere: a bus round-trip would time out, so an
        // immediate success proves the call never left the process.
        let result = view.call_tool(INIT_SKILL, serde_json::json!({})).await.unwrap();
        assert_eq!(
            result,
            serde_json::json!({ "content": [{ "type": "text", "text": "hello" }] })
        );
    }

    #[tokio::test]
    async fn call_tool_routes_by_tool_id() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        // Fake executor answering on the tool's global call subject.
        let bus_for_server = bus.clone();
        tokio::spawn(async move {
            let mut sub = bus_for_server
                .subscribe(&subjects::call_tool_global("0xE"))
                .await
                .unwrap();
            while let Some(msg) = sub.next().await {
                let request: CallToolRequest = serde_json::from_slice(&msg.payload).unwrap();
                assert!(matches!(request, CallToolRequest::McpTool { ref tool_id, .. } if tool_id == "0xE"));
                let response = CallToolResponse::Success {
                    executed_by_id_or_agent: "0xR".into(),
                    result: serde_json::json!({ "content": [] }),
                };
                if let Some(reply) = msg.reply {
                    bus_for_server
                        .publish(&reply, serde_json::to_vec(&response).unwrap())
                        .await
                        .unwrap();
                }
            }
        });

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let result = view.call_tool("echo", serde_json::json!({ "x": 1 })).await.unwrap();
        assert_eq!(result["content"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_tool_name_fails_locally() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let err = view.call_tool("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn error_response_becomes_call_failed() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let bus_for_server = bus.clone();
        tokio::spawn(async move {
            let mut sub = bus_for_server
                .subscribe(&subjects::call_tool_global("0xE"))
                .await
                .unwrap();
            while let Some(msg) = sub.next().await {
                let response = CallToolResponse::error("tool not found");
                if let Some(reply) = msg.reply {
                    bus_for_server
                        .publish(&reply, serde_json::to_vec(&response).unwrap())
                        .await
                        .unwrap();
                }
            }
        });

        let view = SessionToolsetView::new(Arc::new(bus), identity, Duration::from_secs(1))
            .await
            .unwrap();
        view.wait_for_tools().await;

        let err = view.call_tool("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, Error::CallFailed(ref m) if m == "tool not found"));
    }

    #[tokio::test]
    async fn change_stream_signals_every_arrival() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        put_catalog(&bus, &identity, &echo_catalog()).await;

        let view = SessionToolsetView::new(Arc::new(bus.clone()), identity.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        let mut changes = view.take_changes().unwrap();
        assert!(view.take_changes().is_none());

        // One signal for the value present at attach, one per later put.
        changes.recv().await.unwrap();
        put_catalog(&bus, &identity, &echo_catalog()).await;
        changes.recv().await.unwrap();
    }

    #[tokio::test]
    async fn close_unsubscribes_the_watch() {
        let bus = MemoryBus::new();
        let identity = toolset_identity();
        let subject = subjects::toolset_catalog("0xW", "0xT");

        let view = SessionToolsetView::new(Arc::new(bus.clone()), identity, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(&format!("$KV.{subject}")), 1);

        view.close();
        assert_eq!(bus.subscriber_count(&format!("$KV.{subject}")), 0);
        // Closing again is a no-op.
        view.close();
    }
}
