//! Desired-state records for smart skills.
//!
//! A smart skill is an LLM-backed tool local to the runtime: one model
//! configuration, one system prompt, and the set of MCP tools it may call.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::provider::{ExecutionTarget, ToolRecord};

/// Model configuration for a smart skill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// One smart skill as the control plane wants it to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSmartSkill {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    pub model: ModelConfig,
    /// MCP tools the skill may call during a turn.
    #[serde(default)]
    pub tools: Vec<ToolRecord>,
}

impl DesiredSmartSkill {
    /// Deterministic digest of (model config, sorted tool-id set), used by
    /// the reconciler the same way provider signatures are.
    pub fn config_signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.model.as_bytes());
        hasher.update(
            self.model
                .temperature
                .map(|t| t.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(
            self.model
                .max_tokens
                .map(|t| t.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(self.model.system_prompt.as_deref().unwrap_or("").as_bytes());

        let mut tool_ids: Vec<&str> = self.tools.iter().map(|t| t.id.as_str()).collect();
        tool_ids.sort_unstable();
        for id in tool_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
        }

        hex::encode(hasher.finalize())
    }
}
