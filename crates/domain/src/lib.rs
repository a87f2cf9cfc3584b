//! Shared domain types for the toolmesh runtime.
//!
//! Everything the other crates agree on lives here: the env-driven
//! configuration, the shared error taxonomy, and the desired-state records
//! the control plane publishes (providers, smart skills, roots).

pub mod config;
pub mod error;
pub mod provider;
pub mod roots;
pub mod skill;

pub use config::{Config, ProcessMode};
pub use error::{Error, Result};
pub use provider::{DesiredProvider, ExecutionTarget, ToolRecord, TransportKind};
pub use roots::Root;
pub use skill::{DesiredSmartSkill, ModelConfig};
