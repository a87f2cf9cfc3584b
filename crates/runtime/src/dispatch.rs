//! Tool-call dispatcher.
//!
//! Owns the table of bus subscriptions per tool and per smart skill. Tools
//! of CLOUD-target providers are subscribed on workspace-agnostic subjects;
//! AGENT-target tools and smart skills on runtime-scoped subjects. Incoming
//! call messages are decoded at the subscription boundary and answered on
//! their reply subject; a frame arriving on the wrong kind of subscription
//! is refused with a structured error, never guessed at.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;

use tm_bus::{subjects, Bus, Subscription, SubscriptionHandle};
use tm_domain::{Error, ExecutionTarget, Result};
use tm_provider::{ProviderRunner, SmartSkillRunner};
use tm_wire::{CallToolRequest, CallToolResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Table entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SubEntry {
    subject: String,
    handle: SubscriptionHandle,
    task: tokio::task::JoinHandle<()>,
}

impl SubEntry {
    fn close(&self) {
        self.handle.close();
        self.task.abort();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct DispatcherInner {
    bus: Arc<dyn Bus>,
    /// Stamped on every success response.
    executed_by: String,
    workspace_id: Option<String>,
    runtime_id: Option<String>,
    /// Runners registered by the reconciler; read-only lookups here.
    providers: RwLock<HashMap<String, Arc<ProviderRunner>>>,
    skills: RwLock<HashMap<String, Arc<SmartSkillRunner>>>,
}

/// The dispatcher proper. The two-level subscription table (provider id →
/// tool id → handle) is guarded by an async mutex so that every mutation
/// (the reconciler's `ensure`/`unsubscribe` calls) is fully serialized.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    table: Mutex<HashMap<String, HashMap<String, SubEntry>>>,
    skill_table: Mutex<HashMap<String, SubEntry>>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn Bus>,
        executed_by: String,
        workspace_id: Option<String>,
        runtime_id: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                bus,
                executed_by,
                workspace_id,
                runtime_id,
                providers: RwLock::new(HashMap::new()),
                skills: RwLock::new(HashMap::new()),
            }),
            table: Mutex::new(HashMap::new()),
            skill_table: Mutex::new(HashMap::new()),
        }
    }

    /// Sync this provider's subscriptions to its current tool list: exactly
    /// one subscription per listed tool id, none for tools no longer listed.
    /// Re-ensuring an already-subscribed pair is a no-op.
    ///
    /// Subjects are validated for *all* tools before the first subscription
    /// is created, so a missing runtime or workspace id leaves the table
    /// untouched.
    pub async fn ensure_tools_subscribed(&self, runner: Arc<ProviderRunner>) -> Result<()> {
        let provider_id = runner.id().to_string();
        let desired = runner.desired().clone();

        // Validate up front.
        let mut wanted: HashMap<String, String> = HashMap::new();
        for tool in &desired.tools {
            let subject = self.call_subject(desired.execution_target, &tool.id)?;
            wanted.insert(tool.id.clone(), subject);
        }

        self.inner
            .providers
            .write()
            .insert(provider_id.clone(), runner);

        let mut table = self.table.lock().await;
        let entries = table.entry(provider_id.clone()).or_default();

        // Close subscriptions for tools that fell off the list.
        let stale: Vec<String> = entries
            .keys()
            .filter(|tool_id| !wanted.contains_key(*tool_id))
            .cloned()
            .collect();
        for tool_id in stale {
            if let Some(entry) = entries.remove(&tool_id) {
                tracing::debug!(
                    provider_id = %provider_id,
                    tool_id = %tool_id,
                    "closing subscription for delisted tool"
                );
                entry.close();
            }
        }

        // Subscribe the missing ones.
        for (tool_id, subject) in wanted {
            if entries.contains_key(&tool_id) {
                continue;
            }
            let sub = self
                .inner
                .bus
                .subscribe(&subject)
                .await
                .map_err(|e| Error::Bus(e.to_string()))?;
            let handle = sub.handle();
            let task = tokio::spawn(tool_consumer_loop(self.inner.clone(), sub));
            tracing::debug!(
                provider_id = %provider_id,
                tool_id = %tool_id,
                subject = %subject,
                "tool subscription installed"
            );
            entries.insert(
                tool_id,
                SubEntry {
                    subject,
                    handle,
                    task,
                },
            );
        }

        Ok(())
    }

    /// Remove every subscription for a provider. Closing is tolerant:
    /// each entry is torn down even if the previous one misbehaved, and
    /// removing an unknown provider is a no-op.
    pub async fn unsubscribe_all(&self, provider_id: &str) {
        self.inner.providers.write().remove(provider_id);
        let mut table = self.table.lock().await;
        if let Some(entries) = table.remove(provider_id) {
            let count = entries.len();
            for entry in entries.values() {
                entry.close();
            }
            tracing::debug!(provider_id = %provider_id, count, "provider subscriptions removed");
        }
    }

    /// Subscribe one smart skill on its runtime-scoped subject. Idempotent.
    pub async fn ensure_skill_subscribed(&self, runner: Arc<SmartSkillRunner>) -> Result<()> {
        let skill_id = runner.id().to_string();
        let workspace = self.require_workspace()?;
        let runtime = self.require_runtime()?;
        let subject = subjects::call_skill(&workspace, &runtime, &skill_id);

        self.inner.skills.write().insert(skill_id.clone(), runner);

        let mut table = self.skill_table.lock().await;
        if table.contains_key(&skill_id) {
            return Ok(());
        }
        let sub = self
            .inner
            .bus
            .subscribe(&subject)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        let handle = sub.handle();
        let task = tokio::spawn(skill_consumer_loop(self.inner.clone(), sub));
        tracing::debug!(skill_id = %skill_id, subject = %subject, "skill subscription installed");
        table.insert(
            skill_id,
            SubEntry {
                subject,
                handle,
                task,
            },
        );
        Ok(())
    }

    /// Remove a smart skill's subscription. No-op when absent.
    pub async fn unsubscribe_skill(&self, skill_id: &str) {
        self.inner.skills.write().remove(skill_id);
        if let Some(entry) = self.skill_table.lock().await.remove(skill_id) {
            entry.close();
            tracing::debug!(skill_id = %skill_id, "skill subscription removed");
        }
    }

    /// Close everything (shutdown path).
    pub async fn shutdown(&self) {
        let provider_ids: Vec<String> = self.table.lock().await.keys().cloned().collect();
        for provider_id in provider_ids {
            self.unsubscribe_all(&provider_id).await;
        }
        let skill_ids: Vec<String> = self.skill_table.lock().await.keys().cloned().collect();
        for skill_id in skill_ids {
            self.unsubscribe_skill(&skill_id).await;
        }
    }

    // ── Test observability ──────────────────────────────────────────

    pub async fn subscription_subjects(&self, provider_id: &str) -> Vec<String> {
        self.table
            .lock()
            .await
            .get(provider_id)
            .map(|entries| entries.values().map(|e| e.subject.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn subscription_count(&self, provider_id: &str) -> usize {
        self.table
            .lock()
            .await
            .get(provider_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub async fn skill_subscription_count(&self) -> usize {
        self.skill_table.lock().await.len()
    }

    // ── Internal ────────────────────────────────────────────────────

    fn call_subject(&self, target: ExecutionTarget, tool_id: &str) -> Result<String> {
        match target {
            ExecutionTarget::Cloud => Ok(subjects::call_tool_global(tool_id)),
            ExecutionTarget::Agent => {
                let workspace = self.require_workspace()?;
                let runtime = self.require_runtime()?;
                Ok(subjects::call_tool_runtime(&workspace, &runtime, tool_id))
            }
        }
    }

    fn require_workspace(&self) -> Result<String> {
        self.inner
            .workspace_id
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("workspace id required for subscription".into()))
    }

    fn require_runtime(&self) -> Result<String> {
        self.inner
            .runtime_id
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("runtime id required for subscription".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer loops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-subject consumer for provider tools. Each message is handled in its
/// own task so one slow tool call cannot block the subject's queue.
async fn tool_consumer_loop(inner: Arc<DispatcherInner>, mut sub: Subscription) {
    while let Some(msg) = sub.next().await {
        let Some(reply) = msg.reply else {
            tracing::warn!(subject = %msg.subject, "call message without reply subject, dropping");
            continue;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let response = handle_tool_message(&inner, &msg.payload).await;
            respond(&inner, &reply, &response).await;
        });
    }
}

async fn skill_consumer_loop(inner: Arc<DispatcherInner>, mut sub: Subscription) {
    while let Some(msg) = sub.next().await {
        let Some(reply) = msg.reply else {
            tracing::warn!(subject = %msg.subject, "skill call without reply subject, dropping");
            continue;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let response = handle_skill_message(&inner, &msg.payload).await;
            respond(&inner, &reply, &response).await;
        });
    }
}

async fn respond(inner: &DispatcherInner, reply: &str, response: &CallToolResponse) {
    match serde_json::to_vec(response) {
        Ok(payload) => {
            if let Err(e) = inner.bus.publish(reply, payload).await {
                tracing::warn!(error = %e, "failed to publish call-tool response");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize call-tool response"),
    }
}

async fn handle_tool_message(inner: &DispatcherInner, payload: &[u8]) -> CallToolResponse {
    let request: CallToolRequest = match serde_json::from_slice(payload) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable call-tool request");
            return CallToolResponse::error(
                "invalid call-tool request: missing or unknown type discriminator",
            );
        }
    };

    let (tool_id, arguments) = match request {
        CallToolRequest::McpTool { tool_id, arguments } => (tool_id, arguments),
        CallToolRequest::SmartSkill { skill_id, .. } => {
            tracing::warn!(skill_id = %skill_id, "smart-skill request on an mcp-tool subject");
            return CallToolResponse::error("smart-skill call routed to an mcp-tool subscription");
        }
    };

    // Resolve the owning runner: exactly one running provider must list the
    // tool id.
    let owner = {
        let providers = inner.providers.read();
        let mut owners = providers.values().filter_map(|runner| {
            runner
                .desired()
                .tools
                .iter()
                .find(|t| t.id == tool_id)
                .map(|t| (runner.clone(), t.name.clone()))
        });
        let first = owners.next();
        if owners.next().is_some() {
            tracing::warn!(tool_id = %tool_id, "tool id owned by multiple providers");
            return CallToolResponse::error(format!("tool {tool_id} owned by multiple providers"));
        }
        first
    };

    let Some((runner, tool_name)) = owner else {
        return CallToolResponse::error("tool not found");
    };

    match runner.call_tool(&tool_name, arguments).await {
        Ok(result) => CallToolResponse::Success {
            executed_by_id_or_agent: inner.executed_by.clone(),
            result,
        },
        Err(e) => {
            tracing::warn!(tool_id = %tool_id, error = %e, "tool call failed");
            CallToolResponse::error(e.to_string())
        }
    }
}

async fn handle_skill_message(inner: &DispatcherInner, payload: &[u8]) -> CallToolResponse {
    let request: CallToolRequest = match serde_json::from_slice(payload) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable skill call request");
            return CallToolResponse::error(
                "invalid call-tool request: missing or unknown type discriminator",
            );
        }
    };

    let (skill_id, arguments) = match request {
        CallToolRequest::SmartSkill {
            skill_id,
            arguments,
        } => (skill_id, arguments),
        CallToolRequest::McpTool { tool_id, .. } => {
            tracing::warn!(tool_id = %tool_id, "mcp-tool request on a smart-skill subject");
            return CallToolResponse::error("mcp-tool call routed to a smart-skill subscription");
        }
    };

    let runner = inner.skills.read().get(&skill_id).cloned();
    let Some(runner) = runner else {
        return CallToolResponse::error("tool not found");
    };

    let messages = skill_messages(&arguments);
    match runner.chat(&messages).await {
        Ok(text) => CallToolResponse::Success {
            executed_by_id_or_agent: inner.executed_by.clone(),
            result: serde_json::json!({
                "content": [{ "type": "text", "text": text }]
            }),
        },
        Err(e) => {
            tracing::warn!(skill_id = %skill_id, error = %e, "skill chat failed");
            CallToolResponse::Success {
                executed_by_id_or_agent: inner.executed_by.clone(),
                result: serde_json::json!({
                    "content": [{ "type": "text", "text": format!("Error: {e}") }],
                    "isError": true
                }),
            }
        }
    }
}

/// Extract the user messages from a skill call's arguments:
/// `messages` array, else `message`, else `input`, else the whole blob
/// stringified.
fn skill_messages(arguments: &Value) -> Vec<String> {
    if let Some(messages) = arguments.get("messages").and_then(Value::as_array) {
        return messages
            .iter()
            .map(|m| match m.as_str() {
                Some(s) => s.to_string(),
                None => m.to_string(),
            })
            .collect();
    }
    for key in ["message", "input"] {
        if let Some(text) = arguments.get(key).and_then(Value::as_str) {
            return vec![text.to_string()];
        }
    }
    vec![arguments.to_string()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tm_bus::MemoryBus;
    use tm_domain::provider::{DesiredProvider, ToolRecord, TransportKind};

    fn make_dispatcher(bus: &MemoryBus) -> Dispatcher {
        Dispatcher::new(
            Arc::new(bus.clone()),
            "0xR".into(),
            Some("0xW".into()),
            Some("0xR".into()),
        )
    }

    fn echo_script() -> &'static str {
        concat!(
            r#"read init; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'; "#,
            r#"read initialized; read listreq; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'; "#,
            r#"read callreq; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'; "#,
            r#"sleep 10"#
        )
    }

    fn desired(target: ExecutionTarget, tools: &[(&str, &str)]) -> DesiredProvider {
        DesiredProvider {
            id: "0xP".into(),
            name: "scripted".into(),
            transport: TransportKind::Stdio,
            config: serde_json::json!({ "command": "sh", "args": ["-c", echo_script()] }),
            execution_target: target,
            tools: tools
                .iter()
                .map(|(id, name)| ToolRecord {
                    id: (*id).into(),
                    name: (*name).into(),
                    description: String::new(),
                })
                .collect(),
        }
    }

    async fn start_runner(target: ExecutionTarget, tools: &[(&str, &str)]) -> Arc<ProviderRunner> {
        ProviderRunner::start(desired(target, tools), vec![]).await.unwrap()
    }

    #[tokio::test]
    async fn agent_target_uses_runtime_scoped_subject() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Agent, &[("0xT", "echo")]).await;

        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();

        let subjects = dispatcher.subscription_subjects("0xP").await;
        assert_eq!(subjects, vec![subjects::call_tool_runtime("0xW", "0xR", "0xT")]);
        assert_eq!(bus.subscriber_count(&subjects::call_tool_global("0xT")), 0);

        runner.stop().await;
    }

    #[tokio::test]
    async fn cloud_target_uses_global_subject() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;

        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        assert_eq!(
            dispatcher.subscription_subjects("0xP").await,
            vec![subjects::call_tool_global("0xT")]
        );

        runner.stop().await;
    }

    #[tokio::test]
    async fn agent_target_without_runtime_id_fails_before_subscribing() {
        let bus = MemoryBus::new();
        let dispatcher = Dispatcher::new(Arc::new(bus.clone()), "AGENT".into(), Some("0xW".into()), None);
        let runner = start_runner(ExecutionTarget::Agent, &[("0xT", "echo")]).await;

        let err = dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(dispatcher.subscription_count("0xP").await, 0);

        runner.stop().await;
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;

        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();

        assert_eq!(dispatcher.subscription_count("0xP").await, 1);
        assert_eq!(bus.subscriber_count(&subjects::call_tool_global("0xT")), 1);

        runner.stop().await;
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_the_table() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo"), ("0xU", "other")]).await;

        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        assert_eq!(dispatcher.subscription_count("0xP").await, 2);

        dispatcher.unsubscribe_all("0xP").await;
        assert_eq!(dispatcher.subscription_count("0xP").await, 0);
        assert_eq!(bus.subscriber_count(&subjects::call_tool_global("0xT")), 0);

        // Removing again is a no-op.
        dispatcher.unsubscribe_all("0xP").await;

        runner.stop().await;
    }

    #[tokio::test]
    async fn call_roundtrip_with_executor_tag() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();

        let request = CallToolRequest::McpTool {
            tool_id: "0xT".into(),
            arguments: serde_json::json!({}),
        };
        let raw = bus
            .request(
                &subjects::call_tool_global("0xT"),
                serde_json::to_vec(&request).unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let response: CallToolResponse = serde_json::from_slice(&raw).unwrap();
        match response {
            CallToolResponse::Success {
                executed_by_id_or_agent,
                result,
            } => {
                assert_eq!(executed_by_id_or_agent, "0xR");
                assert_eq!(result["content"][0]["text"], "pong");
            }
            other => panic!("expected success, got {other:?}"),
        }

        runner.stop().await;
    }

    #[tokio::test]
    async fn unknown_tool_id_answers_not_found() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();

        // Valid subject, but the provider no longer lists the tool: swap in
        // a request for an id nobody owns.
        let request = CallToolRequest::McpTool {
            tool_id: "0xMissing".into(),
            arguments: serde_json::json!({}),
        };
        // Publish straight onto the live subject.
        let raw = bus
            .request(
                &subjects::call_tool_global("0xT"),
                serde_json::to_vec(&request).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: CallToolResponse = serde_json::from_slice(&raw).unwrap();
        assert_eq!(response, CallToolResponse::error("tool not found"));

        runner.stop().await;
    }

    #[tokio::test]
    async fn cross_routed_and_untyped_requests_are_refused() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        let subject = subjects::call_tool_global("0xT");

        // A smart-skill frame on an mcp-tool subject.
        let cross = CallToolRequest::SmartSkill {
            skill_id: "0xS".into(),
            arguments: serde_json::json!({}),
        };
        let raw = bus
            .request(&subject, serde_json::to_vec(&cross).unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let response: CallToolResponse = serde_json::from_slice(&raw).unwrap();
        assert!(matches!(response, CallToolResponse::Error { .. }));

        // A legacy frame without the discriminator.
        let raw = bus
            .request(
                &subject,
                br#"{ "toolId": "0xT", "arguments": {} }"#.to_vec(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: CallToolResponse = serde_json::from_slice(&raw).unwrap();
        match response {
            CallToolResponse::Error { message } => assert!(message.contains("discriminator")),
            other => panic!("expected error, got {other:?}"),
        }

        runner.stop().await;
    }

    #[tokio::test]
    async fn resync_closes_delisted_tools() {
        let bus = MemoryBus::new();
        let dispatcher = make_dispatcher(&bus);
        let runner = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo"), ("0xU", "other")]).await;
        dispatcher.ensure_tools_subscribed(runner.clone()).await.unwrap();
        assert_eq!(dispatcher.subscription_count("0xP").await, 2);

        // The next snapshot lists only 0xT.
        let shrunk = start_runner(ExecutionTarget::Cloud, &[("0xT", "echo")]).await;
        dispatcher.ensure_tools_subscribed(shrunk.clone()).await.unwrap();
        assert_eq!(dispatcher.subscription_count("0xP").await, 1);
        assert_eq!(bus.subscriber_count(&subjects::call_tool_global("0xU")), 0);

        runner.stop().await;
        shrunk.stop().await;
    }

    #[test]
    fn skill_message_extraction_order() {
        let args = serde_json::json!({ "messages": ["a", "b"] });
        assert_eq!(skill_messages(&args), vec!["a", "b"]);

        let args = serde_json::json!({ "message": "single" });
        assert_eq!(skill_messages(&args), vec!["single"]);

        let args = serde_json::json!({ "input": "typed" });
        assert_eq!(skill_messages(&args), vec!["typed"]);

        let args = serde_json::json!({ "question": "what?" });
        assert_eq!(skill_messages(&args), vec![r#"{"question":"what?"}"#]);
    }
}
