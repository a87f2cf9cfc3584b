//! Tool-provider supervision.
//!
//! One [`ProviderRunner`] per desired provider (stdio child process or HTTP
//! client), one [`SmartSkillRunner`] per desired smart skill. Runners are
//! created and stopped exclusively by the reconciler; the dispatcher calls
//! into them for tool execution.

pub mod llm;
pub mod protocol;
pub mod runner;
pub mod skill;
pub mod transport;

pub use llm::{ChatClient, LlmError};
pub use protocol::{ToolCallContent, ToolCallResult, ToolDef};
pub use runner::{ProviderError, ProviderRunner};
pub use skill::SmartSkillRunner;
pub use transport::{ProviderTransport, TransportError};
