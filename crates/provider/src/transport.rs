//! Provider transport layer.
//!
//! A tool provider is reached over one of:
//! - **Stdio**: a spawned child process, JSON-RPC over stdin/stdout, one
//!   message per line. Concurrent requests are matched to responses by id
//!   through a pending-request map; provider-initiated notifications are
//!   surfaced on a channel.
//! - **Http**: a remote endpoint (SSE or streamable flavor), JSON-RPC in
//!   POST bodies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};

use tm_domain::provider::{HttpProviderConfig, StdioProviderConfig, TransportKind};
use tm_domain::Root;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Per-request response timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful-stop polling cadence and budget.
const GRACE_POLL: Duration = Duration::from_millis(50);
const GRACE_BUDGET: Duration = Duration::from_millis(1000);

/// Capacity of the provider-notification channel.
const NOTIFICATION_CAPACITY: usize = 16;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait & errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the matching response. Safe to
    /// call concurrently; responses are matched by id.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError>;

    /// Take the provider-notification stream. Yields `Some` exactly once;
    /// transports without push notifications yield `None`.
    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>>;

    fn is_alive(&self) -> bool;

    /// Tear the transport down. For stdio this escalates SIGTERM → SIGKILL.
    async fn stop(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider process has exited")]
    ProcessExited,

    #[error("timeout waiting for response to {0}")]
    Timeout(String),

    #[error("HTTP transport error: {0}")]
    Http(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Stdio transport: a spawned child process speaking newline-delimited
/// JSON-RPC. A dedicated reader task routes responses to their waiting
/// callers, answers provider-initiated `roots/list` requests, and forwards
/// notifications.
pub struct StdioTransport {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Mutex<Child>,
    pid: i32,
    pending: PendingMap,
    notifications: parking_lot::Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the configured child and start the reader task. `roots` is
    /// shared with the owning runner; the reader answers the provider's
    /// `roots/list` requests from it.
    pub fn spawn(
        config: &StdioProviderConfig,
        roots: Arc<parking_lot::RwLock<Vec<Root>>>,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or(TransportError::ProcessExited)? as i32;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        // Drain stderr so the child cannot block on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "provider_stderr", line = %line);
                }
            });
        }

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let reader = tokio::spawn(reader_loop(
            stdout,
            stdin.clone(),
            pending.clone(),
            notif_tx,
            alive.clone(),
            roots,
        ));

        Ok(Self {
            stdin,
            child: Mutex::new(child),
            pid,
            pending,
            notifications: parking_lot::Mutex::new(Some(notif_rx)),
            next_id: AtomicU64::new(1),
            alive,
            reader: parking_lot::Mutex::new(Some(reader)),
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Reader task: classify each stdout line and route it.
async fn reader_loop(
    stdout: tokio::process::ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    notif_tx: mpsc::Sender<JsonRpcNotification>,
    alive: Arc<AtomicBool>,
    roots: Arc<parking_lot::RwLock<Vec<Root>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            // Misbehaving providers log to stdout; skip the noise.
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable provider line");
                continue;
            }
        };

        if value.get("id").is_some() && value.get("method").is_some() {
            // Provider-initiated request. `roots/list` is the only one we
            // answer; everything else gets method-not-found.
            let id = value["id"].clone();
            let method = value["method"].as_str().unwrap_or("");
            let response = if method == "roots/list" {
                let roots_json: Vec<Value> = roots
                    .read()
                    .iter()
                    .map(|r| serde_json::json!({ "name": r.name, "uri": r.uri }))
                    .collect();
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "roots": roots_json }
                })
            } else {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {method}") }
                })
            };
            let mut stdin = stdin.lock().await;
            let _ = stdin.write_all(response.to_string().as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        } else if value.get("id").is_some() {
            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(resp) => {
                    let waiter = pending.lock().remove(&resp.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        None => {
                            tracing::debug!(id = resp.id, "response for unknown request");
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unparseable provider response"),
            }
        } else if let Ok(notif) = serde_json::from_value::<JsonRpcNotification>(value) {
            if notif_tx.try_send(notif).is_err() {
                tracing::warn!("provider notification channel full, dropping");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Wake every waiter: dropping the senders yields RecvError.
    pending.lock().clear();
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout(method.to_string()))
            }
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method, params);
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.notifications.lock().take()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let mut child = self.child.lock().await;
        let pid = Pid::from_raw(self.pid);

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(error = %e, pid = self.pid, "SIGTERM failed (already gone?)");
        }

        // Poll for exit, escalate to SIGKILL when the budget runs out.
        let mut exited = false;
        let attempts = (GRACE_BUDGET.as_millis() / GRACE_POLL.as_millis()) as u32;
        for _ in 0..attempts {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(?status, pid = self.pid, "provider exited after SIGTERM");
                    exited = true;
                    break;
                }
                Ok(None) => tokio::time::sleep(GRACE_POLL).await,
                Err(e) => {
                    tracing::warn!(error = %e, "error polling provider exit");
                    break;
                }
            }
        }

        if !exited {
            tracing::warn!(pid = self.pid, "provider ignored SIGTERM, sending SIGKILL");
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                tracing::warn!(error = %e, "SIGKILL failed");
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(error = %e, "error reaping provider after SIGKILL");
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP transport for SSE and streamable providers: each JSON-RPC frame is
/// one POST. Streamable endpoints may answer with a one-event SSE body; the
/// first `data:` line is taken as the response.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    kind: TransportKind,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn connect(
        config: &HttpProviderConfig,
        kind: TransportKind,
    ) -> Result<Self, TransportError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            let name: reqwest::header::HeaderName = name
                .parse()
                .map_err(|_| TransportError::Http(format!("invalid header name: {name}")))?;
            let value = value
                .parse()
                .map_err(|_| TransportError::Http(format!("invalid header value for {name}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            kind,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        self.client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let response = self.post(&req).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let raw = if content_type.starts_with("text/event-stream") {
            body.lines()
                .find_map(|l| l.strip_prefix("data:"))
                .map(str::trim)
                .ok_or_else(|| TransportError::Http("empty event stream response".into()))?
                .to_string()
        } else {
            body
        };

        Ok(serde_json::from_str(&raw)?)
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method, params);
        self.post(&notif).await?;
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        None
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> StdioProviderConfig {
        StdioProviderConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
        }
    }

    fn no_roots() -> Arc<parking_lot::RwLock<Vec<Root>>> {
        Arc::new(parking_lot::RwLock::new(Vec::new()))
    }

    #[tokio::test]
    async fn request_gets_matching_response() {
        // The child answers the first request (id 1) with a fixed response.
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 5"#;
        let transport = StdioTransport::spawn(&sh(script), no_roots()).unwrap();

        let resp = transport.send_request("tools/list", None).await.unwrap();
        assert_eq!(resp.id, 1);
        assert_eq!(resp.result.unwrap()["ok"], true);

        transport.stop().await;
    }

    #[tokio::test]
    async fn notification_is_forwarded_before_response() {
        let script = concat!(
            r#"read line; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'; sleep 5"#
        );
        let transport = StdioTransport::spawn(&sh(script), no_roots()).unwrap();
        let mut notifications = transport.take_notifications().unwrap();

        let resp = transport.send_request("tools/list", None).await.unwrap();
        assert!(!resp.is_error());

        let notif = notifications.recv().await.unwrap();
        assert_eq!(notif.method, "notifications/tools/list_changed");

        transport.stop().await;
    }

    #[tokio::test]
    async fn take_notifications_yields_once() {
        let transport = StdioTransport::spawn(&sh("sleep 5"), no_roots()).unwrap();
        assert!(transport.take_notifications().is_some());
        assert!(transport.take_notifications().is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn graceful_stop_of_cooperative_child_is_fast() {
        let transport = StdioTransport::spawn(&sh("sleep 30"), no_roots()).unwrap();
        let start = Instant::now();
        transport.stop().await;
        // sh exits on SIGTERM well inside the first poll intervals.
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn stubborn_child_is_sigkilled_within_budget() {
        // Child ignores SIGTERM; stop() must escalate after ~1s.
        let transport =
            StdioTransport::spawn(&sh(r#"trap "" TERM; sleep 30"#), no_roots()).unwrap();
        let start = Instant::now();
        transport.stop().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= GRACE_BUDGET, "stopped too early: {elapsed:?}");
        assert!(
            elapsed < Duration::from_millis(1500),
            "stop took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn request_after_exit_fails_fast() {
        let transport = StdioTransport::spawn(&sh("exit 0"), no_roots()).unwrap();
        // Give the reader a moment to observe EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = transport.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::ProcessExited));
        transport.stop().await;
    }

    #[tokio::test]
    async fn provider_roots_request_is_answered() {
        // The child asks for roots and echoes what it got back as its own
        // response to our request.
        let script = concat!(
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":900,"method":"roots/list"}'; "#,
            r#"read rootsresp; read req; "#,
            r#"printf '{"jsonrpc":"2.0","id":1,"result":{"echoed":%s}}\n' "$rootsresp"; sleep 5"#
        );
        let roots = Arc::new(parking_lot::RwLock::new(vec![Root {
            name: "workspace".into(),
            uri: "file:///srv/work".into(),
        }]));
        let transport = StdioTransport::spawn(&sh(script), roots).unwrap();

        let resp = transport.send_request("tools/list", None).await.unwrap();
        let echoed = &resp.result.unwrap()["echoed"];
        assert_eq!(echoed["result"]["roots"][0]["uri"], "file:///srv/work");

        transport.stop().await;
    }
}
