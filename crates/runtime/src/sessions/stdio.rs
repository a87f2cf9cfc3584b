//! Stdio consumer transport.
//!
//! A single implicit session speaking newline-delimited JSON-RPC on
//! stdin/stdout. The identity comes from the process-wide handshake, not a
//! per-session one. After the client's `initialized` notification we ask it
//! for its roots and push them to the reconciler so stdio providers see the
//! consumer's workspace.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use tm_bus::Bus;
use tm_domain::{Result, Root};

use crate::reconcile::Reconciler;
use crate::sessions::mcp::{frame_kind, FrameKind, McpSession};
use crate::view::{SessionIdentity, SessionToolsetView};

/// Request id used for the server→client `roots/list` request. A string id
/// cannot collide with the integer ids MCP clients use for their own calls.
const ROOTS_REQUEST_ID: &str = "srv-roots-1";

pub struct StdioSession {
    bus: Arc<dyn Bus>,
    identity: SessionIdentity,
    call_timeout: Duration,
    reconciler: Option<Arc<Reconciler>>,
}

impl StdioSession {
    pub fn new(
        bus: Arc<dyn Bus>,
        identity: SessionIdentity,
        call_timeout: Duration,
        reconciler: Option<Arc<Reconciler>>,
    ) -> Self {
        Self {
            bus,
            identity,
            call_timeout,
            reconciler,
        }
    }

    /// Serve the process's stdin/stdout until EOF.
    pub async fn run(self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one stdio-style connection. Split out from [`Self::run`] so
    /// tests can drive it over in-memory pipes.
    pub async fn serve<R, W>(self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let view = Arc::new(
            SessionToolsetView::new(self.bus.clone(), self.identity.clone(), self.call_timeout)
                .await?,
        );
        let session = McpSession::new("stdio".into(), self.identity.clone(), view.clone());

        // Outbound frames: responses from the handler plus list-changed
        // notifications, merged into a single writer.
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(32);

        let notify_tx = out_tx.clone();
        let mut changes = view.take_changes().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel(1);
            rx
        });
        let notify_task = tokio::spawn(async move {
            while changes.recv().await.is_some() {
                if notify_tx
                    .send(super::mcp::list_changed_notification())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let mut awaiting_roots = false;

        tracing::info!(toolset = %self.identity.name, "stdio session serving");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else {
                        tracing::info!("stdio client disconnected");
                        break;
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let frame: Value = match serde_json::from_str(trimmed) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable stdio frame");
                            continue;
                        }
                    };

                    // The client announced it finished initializing: ask it
                    // for roots.
                    if frame_kind(&frame) == FrameKind::Notification
                        && frame.get("method").and_then(Value::as_str)
                            == Some("notifications/initialized")
                        && self.reconciler.is_some()
                    {
                        awaiting_roots = true;
                        let request = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": ROOTS_REQUEST_ID,
                            "method": "roots/list"
                        });
                        let _ = out_tx.send(request).await;
                        continue;
                    }

                    // The client's answer to our roots request.
                    if awaiting_roots
                        && frame_kind(&frame) == FrameKind::Response
                        && frame.get("id").and_then(Value::as_str) == Some(ROOTS_REQUEST_ID)
                    {
                        awaiting_roots = false;
                        let roots = parse_roots(&frame);
                        tracing::info!(count = roots.len(), "client announced roots");
                        if let Some(reconciler) = &self.reconciler {
                            reconciler.update_roots(roots).await;
                        }
                        continue;
                    }

                    if let Some(response) = session.handle_frame(frame).await {
                        let _ = out_tx.send(response).await;
                    }
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let mut line = frame.to_string();
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = writer.flush().await;
                }
            }
        }

        notify_task.abort();
        session.close();
        Ok(())
    }
}

fn parse_roots(frame: &Value) -> Vec<Root> {
    frame["result"]["roots"]
        .as_array()
        .map(|roots| {
            roots
                .iter()
                .filter_map(|r| {
                    let uri = r.get("uri").and_then(Value::as_str)?;
                    Some(Root {
                        name: r
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        uri: uri.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tm_bus::{subjects, MemoryBus};
    use tm_wire::{CatalogSnapshot, CatalogTool};

    fn identity() -> SessionIdentity {
        SessionIdentity {
            workspace_id: "0xW".into(),
            target_id: "0xT".into(),
            name: "main".into(),
            skill_mode: false,
        }
    }

    async fn put_catalog(bus: &MemoryBus) {
        let snapshot = CatalogSnapshot {
            tools: vec![CatalogTool {
                id: "0xE".into(),
                name: "echo".into(),
                description: String::new(),
                input_schema: r#"{"type":"object"}"#.into(),
                annotations: "{}".into(),
            }],
            ..CatalogSnapshot::default()
        };
        bus.kv_put(
            &subjects::toolset_catalog("0xW", "0xT"),
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .await
        .unwrap();
    }

    /// Next response frame, skipping server-pushed notifications (the
    /// catalog pump may interleave `tools/list_changed` lines).
    async fn read_response<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Value {
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let frame: Value = serde_json::from_str(line.trim()).unwrap();
            if frame.get("id").is_some() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn initialize_then_list_over_pipes() {
        let bus = MemoryBus::new();
        put_catalog(&bus).await;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, mut client_write) = tokio::io::split(client_io);

        let session = StdioSession::new(
            Arc::new(bus),
            identity(),
            Duration::from_millis(200),
            None,
        );
        let server = tokio::spawn(session.serve(server_read, server_write));

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":0,\"method\":\"initialize\",\"params\":{}}\n")
            .await
            .unwrap();
        let mut client_reader = BufReader::new(client_read);
        let response = read_response(&mut client_reader).await;
        assert_eq!(response["id"], 0);
        assert_eq!(response["result"]["serverInfo"]["name"], "main");

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        let response = read_response(&mut client_reader).await;
        assert_eq!(response["result"]["tools"][0]["name"], "init_skill");
        assert_eq!(response["result"]["tools"][1]["name"], "echo");

        // Dropping both client halves closes the duplex pipe; the server
        // sees EOF and returns.
        drop(client_write);
        drop(client_reader);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn parse_roots_handles_missing_names() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": ROOTS_REQUEST_ID,
            "result": { "roots": [
                { "uri": "file:///srv/work", "name": "work" },
                { "uri": "file:///tmp" },
                { "name": "no-uri" }
            ] }
        });
        let roots = parse_roots(&frame);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].name, "work");
        assert_eq!(roots[1].name, "");
        assert_eq!(roots[1].uri, "file:///tmp");
    }
}
