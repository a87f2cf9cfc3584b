//! Bus wire protocol.
//!
//! Every payload the runtime exchanges over the bus lives here: call-tool
//! requests and responses, the identity handshake, desired-state snapshots,
//! discovered-tools publications, toolset catalog snapshots, and presence
//! frames. All payloads are JSON; enums are internally tagged so a decoder
//! can refuse a frame that does not carry its discriminator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tm_domain::{DesiredProvider, DesiredSmartSkill};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call-tool request / response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool invocation arriving on a call subject.
///
/// The `type` discriminator is required; frames without it (the legacy
/// un-typed shape) fail to decode and are answered with an error rather
/// than guessed at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CallToolRequest {
    #[serde(rename = "mcp-tool", rename_all = "camelCase")]
    McpTool {
        tool_id: String,
        #[serde(default)]
        arguments: Value,
    },

    #[serde(rename = "smart-skill", rename_all = "camelCase")]
    SmartSkill {
        skill_id: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// The reply published on a call's reply subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status")]
pub enum CallToolResponse {
    #[serde(rename = "ok", rename_all = "camelCase")]
    Success {
        /// Runtime id when the local identity nature is `runtime`, the
        /// literal `AGENT` otherwise.
        executed_by_id_or_agent: String,
        /// The provider's raw result, passed through untouched.
        result: Value,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl CallToolResponse {
    pub fn error(message: impl Into<String>) -> Self {
        CallToolResponse::Error {
            message: message.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What kind of identity is being established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityNature {
    Runtime,
    Toolset,
    Skill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub key: String,
    pub nature: IdentityNature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pid: u32,
    pub host_ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum HandshakeResponse {
    #[serde(rename = "ok", rename_all = "camelCase")]
    Ok {
        /// Control-plane-assigned identity id.
        id: String,
        workspace_id: String,
        name: String,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        bus_jwt: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Desired-state snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full desired provider set; re-published wholesale on every change.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DesiredProvidersSnapshot {
    #[serde(default)]
    pub providers: Vec<DesiredProvider>,
}

/// Full desired smart-skill set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DesiredSkillsSnapshot {
    #[serde(default)]
    pub skills: Vec<DesiredSmartSkill>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovered tools (runtime → control plane)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTools {
    pub provider_id: String,
    pub tools: Vec<DiscoveredTool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Toolset catalog (control plane → session)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool as published in a toolset/skill catalog. `input_schema` and
/// `annotations` arrive as JSON *strings*; sessions parse them when
/// projecting tools to consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogTool {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: String,
    #[serde(default)]
    pub annotations: String,
}

/// The most recent catalog for one toolset or skill.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub description: Option<String>,
    /// Set when the toolset is a smart skill served as MCP.
    #[serde(default)]
    pub smart_skill_tool: Option<CatalogTool>,
    #[serde(default)]
    pub tools: Vec<CatalogTool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub id: String,
    pub pid: u32,
    pub hostname: String,
    pub version: String,
    pub timestamp_ms: i64,
}

impl Heartbeat {
    pub fn now(id: &str, pid: u32, hostname: &str, version: &str) -> Self {
        Self {
            id: id.into(),
            pid,
            hostname: hostname.into(),
            version: version.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Clean-shutdown presence frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kill {
    pub id: String,
    pub timestamp_ms: i64,
}

impl Kill {
    pub fn now(id: &str) -> Self {
        Self {
            id: id.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
