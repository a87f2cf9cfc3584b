//! Runtime configuration, read from the environment.
//!
//! The control plane owns all durable configuration; the runtime itself only
//! takes identity credentials and transport knobs from env vars, so there is
//! no config file. `Config::from_env()` captures everything once at startup.

use std::fmt;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How this process serves consumers, selected from the environment:
///
/// - `TOOL_SET` set → stdio MCP server for that toolset, no HTTP.
/// - `RUNTIME_KEY` set → full edge runtime: HTTP transports + reconciler
///   + dispatcher.
/// - neither → standalone streamable HTTP, auth not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    StdioMcp,
    EdgeStream,
    StandaloneStream,
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessMode::StdioMcp => "stdio-mcp",
            ProcessMode::EdgeStream => "edge-stream",
            ProcessMode::StandaloneStream => "standalone-stream",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Config {
    // ── Credentials ─────────────────────────────────────────────────
    pub master_key: Option<String>,
    pub toolset_name: Option<String>,
    pub toolset_key: Option<String>,
    pub runtime_key: Option<String>,
    pub runtime_name: Option<String>,
    /// Toolset served over stdio (selects [`ProcessMode::StdioMcp`]).
    pub tool_set: Option<String>,
    pub workspace_id: Option<String>,

    // ── HTTP host ───────────────────────────────────────────────────
    pub remote_port: u16,
    pub allowed_origins: Vec<String>,
    pub prevent_dns_rebinding: bool,
    pub validate_accept_header: bool,

    // ── Bus / timing ────────────────────────────────────────────────
    pub bus_url: String,
    pub call_tool_timeout: Duration,
    pub heartbeat_interval: Duration,

    // ── Smart skills ────────────────────────────────────────────────
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_key: None,
            toolset_name: None,
            toolset_key: None,
            runtime_key: None,
            runtime_name: None,
            tool_set: None,
            workspace_id: None,
            remote_port: 3400,
            allowed_origins: Vec::new(),
            prevent_dns_rebinding: true,
            validate_accept_header: false,
            bus_url: "bus://localhost:4222".into(),
            call_tool_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_secs(30),
            llm_base_url: "https://api.openai.com/v1".into(),
            llm_api_key: None,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_opt(name).map(|v| v == "true" || v == "1")
}

impl Config {
    /// Capture the environment into a typed config. Missing vars fall back
    /// to defaults; nothing is validated here (see [`Config::validate`]).
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            master_key: env_opt("MASTER_KEY"),
            toolset_name: env_opt("TOOLSET_NAME"),
            toolset_key: env_opt("TOOLSET_KEY"),
            runtime_key: env_opt("RUNTIME_KEY"),
            runtime_name: env_opt("RUNTIME_NAME"),
            tool_set: env_opt("TOOL_SET"),
            workspace_id: env_opt("WORKSPACE_ID"),
            remote_port: env_opt("REMOTE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.remote_port),
            allowed_origins: env_opt("MCP_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            prevent_dns_rebinding: env_bool("PREVENT_DNS_REBINDING_ATTACK")
                .unwrap_or(defaults.prevent_dns_rebinding),
            validate_accept_header: env_bool("VALIDATE_ACCEPT_HEADER")
                .unwrap_or(defaults.validate_accept_header),
            bus_url: env_opt("BUS_URL").unwrap_or(defaults.bus_url),
            call_tool_timeout: env_opt("MCP_CALL_TOOL_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_tool_timeout),
            heartbeat_interval: env_opt("HEARTBEAT_INTERVAL_SEC")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            llm_base_url: env_opt("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key: env_opt("LLM_API_KEY"),
        }
    }

    /// Select the process mode (see [`ProcessMode`]).
    pub fn mode(&self) -> ProcessMode {
        if self.tool_set.is_some() {
            ProcessMode::StdioMcp
        } else if self.runtime_key.is_some() {
            ProcessMode::EdgeStream
        } else {
            ProcessMode::StandaloneStream
        }
    }

    /// The workspace id to operate under before a handshake assigns one.
    pub fn workspace_or_default(&self) -> String {
        self.workspace_id.clone().unwrap_or_else(|| "DEFAULT".into())
    }

    /// Validate credential combinations. Startup aborts on any
    /// [`ConfigSeverity::Error`]; warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.master_key.is_some() && self.toolset_key.is_some() {
            issues.push(ConfigIssue::error(
                "MASTER_KEY/TOOLSET_KEY",
                "master key and toolset key are mutually exclusive",
            ));
        }
        if self.master_key.is_some() && self.toolset_name.is_none() {
            issues.push(ConfigIssue::error(
                "TOOLSET_NAME",
                "a master key requires TOOLSET_NAME to select the toolset",
            ));
        }
        if self.toolset_key.is_some() && self.toolset_name.is_some() {
            issues.push(ConfigIssue::error(
                "TOOLSET_NAME",
                "a toolset key already names its toolset; TOOLSET_NAME must not be set",
            ));
        }

        let has_credentials = self.master_key.is_some()
            || self.toolset_key.is_some()
            || self.runtime_key.is_some();
        if !has_credentials {
            // Standalone streamable mode runs without a control plane.
            let severity = match self.mode() {
                ProcessMode::StandaloneStream => ConfigSeverity::Warning,
                _ => ConfigSeverity::Error,
            };
            issues.push(ConfigIssue {
                severity,
                field: "MASTER_KEY/TOOLSET_KEY/RUNTIME_KEY".into(),
                message: "no credentials configured".into(),
            });
        }

        if self.remote_port == 0 {
            issues.push(ConfigIssue::error("REMOTE_PORT", "port must be non-zero"));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
