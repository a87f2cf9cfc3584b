//! Bus subject scheme.
//!
//! Subjects are dot-separated segments under the `toolmesh` prefix. The
//! tuple order inside each builder is contractual: the control plane and
//! every runtime derive the same strings from the same identifiers.

const PREFIX: &str = "toolmesh";

/// Well-known control-plane subject for identity handshakes (request-reply).
pub const HANDSHAKE: &str = "toolmesh.handshake";

/// Desired tool providers for one runtime: `(workspace, runtime)`.
pub fn desired_providers(workspace: &str, runtime: &str) -> String {
    format!("{PREFIX}.{workspace}.{runtime}.providers-publish")
}

/// Desired smart skills for one runtime: `(workspace, runtime)`.
pub fn desired_smart_skills(workspace: &str, runtime: &str) -> String {
    format!("{PREFIX}.{workspace}.{runtime}.smart-skills-publish")
}

/// Discovered tools, runtime → control plane: `(workspace, provider)`.
pub fn discovered_tools(workspace: &str, provider: &str) -> String {
    format!("{PREFIX}.{workspace}.{provider}.discovered-tools")
}

/// Toolset catalog, control plane → session: `(workspace, toolset)`.
pub fn toolset_catalog(workspace: &str, toolset: &str) -> String {
    format!("{PREFIX}.{workspace}.{toolset}.toolset-list-tools")
}

/// Skill catalog, control plane → session: `(workspace, skill)`.
pub fn skill_catalog(workspace: &str, skill: &str) -> String {
    format!("{PREFIX}.{workspace}.{skill}.skill-list-tools")
}

/// Tool call, cloud execution-target: any runtime may answer.
pub fn call_tool_global(tool: &str) -> String {
    format!("{PREFIX}.{tool}.call-tool")
}

/// Tool call, agent execution-target: exactly one runtime answers.
pub fn call_tool_runtime(workspace: &str, runtime: &str, tool: &str) -> String {
    format!("{PREFIX}.{workspace}.{runtime}.{tool}.call-tool")
}

/// Smart-skill call: `(workspace, runtime, skill)`.
pub fn call_skill(workspace: &str, runtime: &str, skill: &str) -> String {
    format!("{PREFIX}.{workspace}.{runtime}.{skill}.call-tool")
}

/// Presence beacon for one identity.
pub fn heartbeat(identity: &str) -> String {
    format!("{PREFIX}.presence.{identity}.heartbeat")
}

/// Clean-shutdown presence message for one identity.
pub fn kill(identity: &str) -> String {
    format!("{PREFIX}.presence.{identity}.kill")
}
