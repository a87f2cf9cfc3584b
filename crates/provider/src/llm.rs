//! OpenAI-compatible chat client for smart skills.
//!
//! One POST to `{base_url}/chat/completions` per turn. Works with OpenAI,
//! Azure-style gateways, Ollama, vLLM, and anything else following the chat
//! completions contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tm_domain::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned HTTP {0}: {1}")]
    Status(u16, String),

    #[error("LLM response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Thin chat-completions client shared by all smart-skill runners.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Run one chat turn and return the assistant's text.
    pub async fn complete(
        &self,
        model: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<String, LlmError> {
        let body = build_chat_body(model, &messages);
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Status(status.as_u16(), text));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))
    }
}

fn build_chat_body(model: &ModelConfig, messages: &[ChatMessage]) -> Value {
    let mut body = serde_json::json!({
        "model": model.model,
        "messages": messages,
    });
    if let Some(temperature) = model.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = model.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelConfig {
        ModelConfig {
            model: "gpt-4o-mini".into(),
            temperature: Some(0.1),
            max_tokens: Some(512),
            system_prompt: None,
        }
    }

    #[test]
    fn chat_body_includes_tuning_knobs() {
        let body = build_chat_body(&model(), &[ChatMessage::user("hi")]);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn chat_body_omits_unset_knobs() {
        let model = ModelConfig {
            model: "gpt-4o".into(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        };
        let body = build_chat_body(&model, &[]);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
    }
}
