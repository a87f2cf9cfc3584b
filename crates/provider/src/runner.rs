//! Provider runner: owns the lifecycle of one tool provider and exposes
//! its live catalog.
//!
//! A runner is constructed from a desired-state record, connects over the
//! configured transport, performs the MCP handshake, and keeps a watch
//! channel updated with the provider's current tool list. The reconciler
//! compares `config_signature()` values to decide reuse vs. respawn.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use tm_domain::provider::ProviderConfig;
use tm_domain::{DesiredProvider, Root};

use crate::protocol::{self, ToolDef, ToolsListResult};
use crate::transport::{HttpTransport, ProviderTransport, StdioTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// A desired provider materialized as a live child (subprocess or HTTP
/// client).
pub struct ProviderRunner {
    desired: DesiredProvider,
    signature: String,
    roots: Arc<parking_lot::RwLock<Vec<Root>>>,
    transport: Arc<dyn ProviderTransport>,
    tools_tx: Arc<watch::Sender<Vec<ToolDef>>>,
    on_stop: parking_lot::Mutex<Option<ShutdownCallback>>,
    refresh_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ProviderRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRunner")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl ProviderRunner {
    /// Validate config, connect, handshake, discover tools, and install the
    /// list-changed handler. Any failure surfaces to the caller; the
    /// reconciler records it and retries on the next desired-state publish.
    pub async fn start(
        desired: DesiredProvider,
        initial_roots: Vec<Root>,
    ) -> Result<Arc<Self>, ProviderError> {
        let parsed = desired
            .parse_config()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let signature = desired.config_signature(initial_roots.len());
        let roots = Arc::new(parking_lot::RwLock::new(initial_roots));

        let transport: Arc<dyn ProviderTransport> = match parsed {
            ProviderConfig::Stdio(cfg) => Arc::new(StdioTransport::spawn(&cfg, roots.clone())?),
            ProviderConfig::Http(cfg) => {
                Arc::new(HttpTransport::connect(&cfg, desired.transport)?)
            }
        };

        // MCP handshake: initialize, then the initialized notification.
        let init_params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| ProviderError::Protocol(format!("serializing initialize: {e}")))?;
        let resp = transport.send_request("initialize", Some(init_params)).await?;
        if let Err(e) = resp.into_result() {
            return Err(ProviderError::Protocol(format!("initialize failed: {e}")));
        }
        transport
            .send_notification("notifications/initialized", None)
            .await?;

        let tools = list_tools(transport.as_ref(), &desired.id).await?;
        tracing::info!(
            provider_id = %desired.id,
            provider = %desired.name,
            transport = desired.transport.as_str(),
            tool_count = tools.len(),
            "provider started"
        );

        let (tools_tx, _) = watch::channel(tools);
        let tools_tx = Arc::new(tools_tx);

        let runner = Arc::new(Self {
            desired,
            signature,
            roots,
            transport: transport.clone(),
            tools_tx: tools_tx.clone(),
            on_stop: parking_lot::Mutex::new(None),
            refresh_task: parking_lot::Mutex::new(None),
        });

        // List-changed handler: on each provider notification, re-list and
        // publish only when the catalog digest actually changed.
        if let Some(mut notifications) = transport.take_notifications() {
            let provider_id = runner.desired.id.clone();
            let task = tokio::spawn(async move {
                let mut last_digest = catalog_digest(&tools_tx.borrow());
                while let Some(notif) = notifications.recv().await {
                    if notif.method != "notifications/tools/list_changed" {
                        tracing::debug!(
                            provider_id = %provider_id,
                            method = %notif.method,
                            "ignoring provider notification"
                        );
                        continue;
                    }
                    match list_tools(transport.as_ref(), &provider_id).await {
                        Ok(tools) => {
                            let digest = catalog_digest(&tools);
                            if digest != last_digest {
                                last_digest = digest;
                                tracing::info!(
                                    provider_id = %provider_id,
                                    tool_count = tools.len(),
                                    "provider tool list changed"
                                );
                                tools_tx.send_replace(tools);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                provider_id = %provider_id,
                                error = %e,
                                "tools/list refresh failed"
                            );
                        }
                    }
                }
            });
            *runner.refresh_task.lock() = Some(task);
        }

        Ok(runner)
    }

    pub fn id(&self) -> &str {
        &self.desired.id
    }

    pub fn desired(&self) -> &DesiredProvider {
        &self.desired
    }

    /// Deterministic signature of (transport, config, root count). Equal
    /// signatures mean the running instance can be reused.
    pub fn config_signature(&self) -> &str {
        &self.signature
    }

    /// The live catalog. Subscribers see the current list immediately and
    /// every change after.
    pub fn tools(&self) -> watch::Receiver<Vec<ToolDef>> {
        self.tools_tx.subscribe()
    }

    /// Forward a call to the provider and return its raw result. Callable
    /// concurrently from multiple dispatcher handlers.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProviderError> {
        if !self.transport.is_alive() {
            return Err(ProviderError::Unavailable(self.desired.id.clone()));
        }
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        resp.into_result()
            .map_err(|e| ProviderError::Protocol(format!("tools/call failed: {e}")))
    }

    /// Replace the advertised roots and notify the provider.
    pub async fn update_roots(&self, roots: Vec<Root>) -> Result<(), ProviderError> {
        {
            let mut current = self.roots.write();
            if *current == roots {
                return Ok(());
            }
            *current = roots;
        }
        self.transport
            .send_notification("notifications/roots/list_changed", None)
            .await?;
        Ok(())
    }

    /// Register a callback invoked once when the runner stops.
    pub fn on_shutdown(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_stop.lock() = Some(Box::new(callback));
    }

    /// Stop the provider: abort the refresh handler, escalate the child
    /// (stdio) or drop the HTTP client, then fire the shutdown callback.
    pub async fn stop(&self) {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.transport.stop().await;
        tracing::info!(provider_id = %self.desired.id, "provider stopped");
        if let Some(callback) = self.on_stop.lock().take() {
            callback();
        }
    }
}

async fn list_tools(
    transport: &dyn ProviderTransport,
    provider_id: &str,
) -> Result<Vec<ToolDef>, ProviderError> {
    let resp = transport.send_request("tools/list", None).await?;
    let result = resp
        .into_result()
        .map_err(|e| ProviderError::Protocol(format!("tools/list failed: {e}")))?;
    match serde_json::from_value::<ToolsListResult>(result) {
        Ok(r) => Ok(r.tools),
        Err(e) => {
            tracing::warn!(
                provider_id = %provider_id,
                error = %e,
                "failed to parse tools/list result"
            );
            Ok(Vec::new())
        }
    }
}

/// Digest of the serialized catalog, for change suppression.
fn catalog_digest(tools: &[ToolDef]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for tool in tools {
        tool.name.hash(&mut hasher);
        tool.description.hash(&mut hasher);
        tool.input_schema.to_string().hash(&mut hasher);
        if let Some(annotations) = &tool.annotations {
            annotations.to_string().hash(&mut hasher);
        }
    }
    hasher.finish()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tm_domain::provider::{ExecutionTarget, TransportKind};

    fn sh_provider(script: &str) -> DesiredProvider {
        DesiredProvider {
            id: "0xP".into(),
            name: "scripted".into(),
            transport: TransportKind::Stdio,
            config: serde_json::json!({ "command": "sh", "args": ["-c", script] }),
            execution_target: ExecutionTarget::Agent,
            tools: vec![],
        }
    }

    /// A child that completes the MCP handshake and serves one echo tool.
    fn echo_server_script() -> &'static str {
        concat!(
            r#"read init; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'; "#,
            r#"read initialized; read listreq; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo back","inputSchema":{"type":"object"}}]}}'; "#,
            r#"read callreq; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'; "#,
            r#"sleep 5"#
        )
    }

    #[tokio::test]
    async fn start_discovers_tools_and_calls_them() {
        let runner = ProviderRunner::start(sh_provider(echo_server_script()), vec![])
            .await
            .unwrap();

        let tools = runner.tools().borrow().clone();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = runner
            .call_tool("echo", serde_json::json!({ "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hi");

        runner.stop().await;
    }

    #[tokio::test]
    async fn shutdown_callback_fires_once_on_stop() {
        let runner = ProviderRunner::start(sh_provider(echo_server_script()), vec![])
            .await
            .unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_cb = fired.clone();
        runner.on_shutdown(move || fired_in_cb.store(true, Ordering::SeqCst));

        runner.stop().await;
        assert!(fired.load(Ordering::SeqCst));

        // Second stop must not panic with the callback already consumed.
        runner.stop().await;
    }

    #[tokio::test]
    async fn list_changed_refreshes_catalog() {
        let script = concat!(
            r#"read init; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'; "#,
            r#"read initialized; read list1; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}'; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'; "#,
            r#"read list2; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"late","inputSchema":{"type":"object"}}]}}'; "#,
            r#"sleep 5"#
        );
        let runner = ProviderRunner::start(sh_provider(script), vec![]).await.unwrap();
        assert!(runner.tools().borrow().is_empty());

        let mut watch = runner.tools();
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow()[0].name, "late");

        runner.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_before_spawn() {
        let mut provider = sh_provider("true");
        provider.config = serde_json::json!({ "args": [] });
        let err = ProviderRunner::start(provider, vec![]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[tokio::test]
    async fn signature_counts_roots() {
        let runner = ProviderRunner::start(sh_provider(echo_server_script()), vec![Root {
            name: "w".into(),
            uri: "file:///w".into(),
        }])
        .await
        .unwrap();

        let desired = runner.desired().clone();
        assert_eq!(runner.config_signature(), desired.config_signature(1));
        assert_ne!(runner.config_signature(), desired.config_signature(0));

        runner.stop().await;
    }
}
