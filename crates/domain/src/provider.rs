//! Desired-state records for tool providers.
//!
//! The control plane publishes the full desired provider set on every change
//! (total-state, not deltas). Each record carries an opaque config blob whose
//! schema depends on the transport kind; the blob is parsed and validated by
//! the provider runner just before spawn.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the runtime connects to a tool provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    /// Spawn a child process, JSON-RPC over stdin/stdout.
    Stdio,
    /// HTTP server-sent-events endpoint.
    Sse,
    /// HTTP streamable endpoint.
    Stream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "STDIO",
            TransportKind::Sse => "SSE",
            TransportKind::Stream => "STREAM",
        }
    }
}

/// Where a provider's tool calls are routed.
///
/// `Agent` binds calls to this specific runtime (runtime-scoped subjects);
/// `Cloud` lets any runtime handle them (global subjects). `EDGE` is an
/// accepted alias for `Cloud`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionTarget {
    Agent,
    #[default]
    #[serde(alias = "EDGE")]
    Cloud,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Desired provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool known to the graph for a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One tool provider as the control plane wants it to run.
///
/// Replaced wholesale on every desired-state publish; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredProvider {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    /// Opaque config blob; schema depends on `transport`.
    pub config: Value,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    /// Current tool list from the graph.
    #[serde(default)]
    pub tools: Vec<ToolRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config blobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stdio provider config: the package to run plus args and env.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StdioProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// SSE / streamable provider config: the endpoint plus extra headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProviderConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A parsed, validated provider config blob.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Stdio(StdioProviderConfig),
    Http(HttpProviderConfig),
}

impl DesiredProvider {
    /// Parse and validate the config blob for this provider's transport.
    ///
    /// Rejects blobs that fail the schema (the error names the offending
    /// field path) and blobs still carrying unsubstituted `${…}` variables
    /// the control plane should have resolved.
    pub fn parse_config(&self) -> Result<ProviderConfig> {
        if let Some(path) = find_unsubstituted_var(&self.config, "config") {
            return Err(Error::ConfigInvalid(format!(
                "provider {}: unsubstituted variable at {path}",
                self.id
            )));
        }

        match self.transport {
            TransportKind::Stdio => {
                let parsed: StdioProviderConfig = serde_json::from_value(self.config.clone())
                    .map_err(|e| {
                        Error::ConfigInvalid(format!(
                            "provider {}: config.{e} (expected {{command, args?, env?}})",
                            self.id
                        ))
                    })?;
                Ok(ProviderConfig::Stdio(parsed))
            }
            TransportKind::Sse | TransportKind::Stream => {
                let parsed: HttpProviderConfig = serde_json::from_value(self.config.clone())
                    .map_err(|e| {
                        Error::ConfigInvalid(format!(
                            "provider {}: config.{e} (expected {{url, headers?}})",
                            self.id
                        ))
                    })?;
                Ok(ProviderConfig::Http(parsed))
            }
        }
    }

    /// Deterministic digest of (transport, config, root count).
    ///
    /// The reconciler reuses a running provider iff its signature matches
    /// the desired record's. serde_json maps serialize key-sorted, so equal
    /// blobs digest equally regardless of publish order.
    pub fn config_signature(&self, root_count: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.transport.as_str().as_bytes());
        hasher.update(self.config.to_string().as_bytes());
        hasher.update(root_count.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Walk a JSON value looking for `${…}` placeholders in string leaves.
/// Returns the path of the first hit.
fn find_unsubstituted_var(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::String(s) if s.contains("${") => Some(path.to_string()),
        Value::Object(map) => map
            .iter()
            .find_map(|(k, v)| find_unsubstituted_var(v, &format!("{path}.{k}"))),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_unsubstituted_var(v, &format!("{path}[{i}]"))),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_provider(config: Value) -> DesiredProvider {
        DesiredProvider {
            id: "0xP".into(),
            name: "files".into(),
            transport: TransportKind::Stdio,
            config,
            execution_target: ExecutionTarget::Agent,
            tools: vec![],
        }
    }

    #[test]
    fn parse_stdio_config() {
        let provider = stdio_provider(serde_json::json!({
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem", "."],
            "env": { "HOME": "/home/u" }
        }));
        match provider.parse_config().unwrap() {
            ProviderConfig::Stdio(cfg) => {
                assert_eq!(cfg.command, "npx");
                assert_eq!(cfg.args.len(), 3);
            }
            other => panic!("expected stdio config, got {other:?}"),
        }
    }

    #[test]
    fn parse_http_config() {
        let provider = DesiredProvider {
            transport: TransportKind::Stream,
            ..stdio_provider(serde_json::json!({ "url": "https://tools.example/mcp" }))
        };
        match provider.parse_config().unwrap() {
            ProviderConfig::Http(cfg) => assert_eq!(cfg.url, "https://tools.example/mcp"),
            other => panic!("expected http config, got {other:?}"),
        }
    }

    #[test]
    fn schema_failure_names_field() {
        let provider = stdio_provider(serde_json::json!({ "args": [] }));
        let err = provider.parse_config().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("0xP"), "missing provider id in: {msg}");
        assert!(msg.contains("command"), "missing field name in: {msg}");
    }

    #[test]
    fn unsubstituted_variable_refused() {
        let provider = stdio_provider(serde_json::json!({
            "command": "npx",
            "env": { "TOKEN": "${SECRET_TOKEN}" }
        }));
        let err = provider.parse_config().unwrap_err();
        assert!(err.to_string().contains("config.env.TOKEN"));
    }

    #[test]
    fn signature_stable_across_key_order() {
        let a = stdio_provider(serde_json::json!({ "command": "npx", "args": ["x"] }));
        let b = stdio_provider(serde_json::json!({ "args": ["x"], "command": "npx" }));
        assert_eq!(a.config_signature(0), b.config_signature(0));
    }

    #[test]
    fn signature_varies_with_inputs() {
        let a = stdio_provider(serde_json::json!({ "command": "npx" }));
        let b = stdio_provider(serde_json::json!({ "command": "uvx" }));
        assert_ne!(a.config_signature(0), b.config_signature(0));
        assert_ne!(a.config_signature(0), a.config_signature(1));

        let c = DesiredProvider {
            transport: TransportKind::Sse,
            ..a.clone()
        };
        assert_ne!(a.config_signature(0), c.config_signature(0));
    }

    #[test]
    fn execution_target_accepts_edge_alias() {
        let target: ExecutionTarget = serde_json::from_str("\"EDGE\"").unwrap();
        assert_eq!(target, ExecutionTarget::Cloud);
        let target: ExecutionTarget = serde_json::from_str("\"AGENT\"").unwrap();
        assert_eq!(target, ExecutionTarget::Agent);
    }
}
