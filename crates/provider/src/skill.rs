//! Smart-skill runner.
//!
//! A smart skill is an LLM-backed tool local to the runtime. The runner has
//! no bus subscriptions of its own; the dispatcher invokes it through
//! [`SmartSkillRunner::chat`].

use tm_domain::DesiredSmartSkill;

use crate::llm::{ChatClient, ChatMessage, LlmError};

pub struct SmartSkillRunner {
    desired: DesiredSmartSkill,
    signature: String,
    llm: ChatClient,
}

impl SmartSkillRunner {
    pub fn new(desired: DesiredSmartSkill, llm: ChatClient) -> Self {
        let signature = desired.config_signature();
        tracing::info!(
            skill_id = %desired.id,
            skill = %desired.name,
            model = %desired.model.model,
            "smart skill ready"
        );
        Self {
            desired,
            signature,
            llm,
        }
    }

    pub fn id(&self) -> &str {
        &self.desired.id
    }

    pub fn name(&self) -> &str {
        &self.desired.name
    }

    pub fn config_signature(&self) -> &str {
        &self.signature
    }

    /// One LLM turn with the configured model and system prompt.
    pub async fn chat(&self, user_messages: &[String]) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(user_messages.len() + 1);
        if let Some(prompt) = &self.desired.model.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend(user_messages.iter().map(|m| ChatMessage::user(m.clone())));

        self.llm.complete(&self.desired.model, messages).await
    }
}
