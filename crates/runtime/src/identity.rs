//! Process identity and authentication.
//!
//! Credentials come from the environment once at startup; identities come
//! from a handshake with the control plane over the bus. The identity
//! manager is process-wide and read-only after handshake; only an explicit
//! credential refresh or [`IdentityManager::clear_identity`] mutates it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use tm_bus::{subjects, Bus};
use tm_domain::{Config, Error, ProcessMode, Result};
use tm_wire::{HandshakeRequest, HandshakeResponse, IdentityNature};

/// Handshake timeout; no retry.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The process-wide identity established by a successful handshake.
#[derive(Debug, Clone)]
pub struct RuntimeIdentity {
    /// Control-plane-assigned id.
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub nature: IdentityNature,
    pub version: String,
    pub pid: u32,
    pub host_ip: String,
    pub hostname: String,
    pub platform: String,
}

/// Mutable in-memory credential set: the configured keys plus whatever the
/// handshake handed back.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub master_key: Option<String>,
    pub toolset_name: Option<String>,
    pub toolset_key: Option<String>,
    pub runtime_key: Option<String>,
    // Post-handshake tokens.
    pub access_token: Option<String>,
    pub bus_jwt: Option<String>,
    pub toolset_id: Option<String>,
    pub skill_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The credential rules shared by startup config and per-session headers:
/// at least one key, not both keys, master-key ⇔ toolset name present,
/// toolset-key ⇔ toolset name absent.
pub fn validate_credentials(
    master_key: Option<&str>,
    toolset_key: Option<&str>,
    toolset_name: Option<&str>,
) -> Result<()> {
    if master_key.is_none() && toolset_key.is_none() {
        return Err(Error::AuthFailed("no credentials provided".into()));
    }
    if master_key.is_some() && toolset_key.is_some() {
        return Err(Error::AuthFailed(
            "master key and toolset key are mutually exclusive".into(),
        ));
    }
    if master_key.is_some() && toolset_name.is_none() {
        return Err(Error::AuthFailed(
            "a master key requires a toolset name".into(),
        ));
    }
    if toolset_key.is_some() && toolset_name.is_some() {
        return Err(Error::AuthFailed(
            "a toolset key must not carry a toolset name".into(),
        ));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Host facts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Best-effort outbound IP: the kernel picks the source address for a UDP
/// socket without sending anything.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".into())
}

pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IdentityManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct IdentityManager {
    bus: Arc<dyn Bus>,
    env_workspace: Option<String>,
    state: RwLock<AuthState>,
    identity: RwLock<Option<RuntimeIdentity>>,
    credentials: RwLock<Credentials>,
}

impl IdentityManager {
    /// Read credentials from the already-captured config, enforcing the
    /// exclusivity rules. In standalone streamable mode missing credentials
    /// are a warning, not a fatal error.
    pub fn load_from_environment(bus: Arc<dyn Bus>, config: &Config) -> Result<Self> {
        let validation = validate_credentials(
            config.master_key.as_deref(),
            config.toolset_key.as_deref(),
            config.toolset_name.as_deref(),
        );
        match validation {
            Ok(()) => {}
            Err(Error::AuthFailed(msg)) if msg.contains("no credentials") => {
                if config.runtime_key.is_none() {
                    if config.mode() == ProcessMode::StandaloneStream {
                        tracing::warn!("no credentials configured, running unauthenticated");
                    } else {
                        return Err(Error::AuthFailed(msg));
                    }
                }
            }
            Err(e) => return Err(e),
        }

        Ok(Self {
            bus,
            env_workspace: config.workspace_id.clone(),
            state: RwLock::new(AuthState::Unauthenticated),
            identity: RwLock::new(None),
            credentials: RwLock::new(Credentials {
                master_key: config.master_key.clone(),
                toolset_name: config.toolset_name.clone(),
                toolset_key: config.toolset_key.clone(),
                runtime_key: config.runtime_key.clone(),
                ..Credentials::default()
            }),
        })
    }

    /// Perform the control-plane handshake and fill the identity.
    /// Timeout 5 s; on timeout or error the state returns to
    /// `Unauthenticated` and the caller gets `AuthFailed`.
    pub async fn handshake(
        &self,
        key: &str,
        nature: IdentityNature,
        name: Option<&str>,
    ) -> Result<RuntimeIdentity> {
        *self.state.write() = AuthState::Authenticating;

        let result = handshake_on(self.bus.as_ref(), key, nature, name).await;
        match result {
            Ok(response) => {
                let identity = RuntimeIdentity {
                    id: response.id.clone(),
                    workspace_id: response.workspace_id.clone(),
                    name: response.name.clone(),
                    nature,
                    version: env!("CARGO_PKG_VERSION").into(),
                    pid: std::process::id(),
                    host_ip: local_ip(),
                    hostname: hostname(),
                    platform: std::env::consts::OS.into(),
                };
                {
                    let mut credentials = self.credentials.write();
                    credentials.access_token = response.access_token;
                    credentials.bus_jwt = response.bus_jwt;
                    match nature {
                        IdentityNature::Toolset => {
                            credentials.toolset_id = Some(response.id);
                        }
                        IdentityNature::Skill => {
                            credentials.skill_id = Some(response.id);
                        }
                        IdentityNature::Runtime => {}
                    }
                }
                *self.identity.write() = Some(identity.clone());
                *self.state.write() = AuthState::Authenticated;
                tracing::info!(
                    identity_id = %identity.id,
                    workspace_id = %identity.workspace_id,
                    nature = ?nature,
                    "handshake complete"
                );
                Ok(identity)
            }
            Err(e) => {
                *self.state.write() = AuthState::Unauthenticated;
                Err(e)
            }
        }
    }

    pub fn identity(&self) -> Option<RuntimeIdentity> {
        self.identity.read().clone()
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }

    /// Merge non-`None` fields into the credential set.
    pub fn set_credentials(&self, partial: Credentials) {
        let mut current = self.credentials.write();
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if partial.$field.is_some() { current.$field = partial.$field; })*
            };
        }
        merge!(
            master_key,
            toolset_name,
            toolset_key,
            runtime_key,
            access_token,
            bus_jwt,
            toolset_id,
            skill_id
        );
    }

    /// Drop the identity but keep credentials so a re-handshake is possible.
    pub fn clear_identity(&self) {
        *self.identity.write() = None;
        *self.state.write() = AuthState::Unauthenticated;
    }

    pub fn has_valid_auth(&self) -> bool {
        *self.state.read() == AuthState::Authenticated
    }

    pub fn auth_state(&self) -> AuthState {
        *self.state.read()
    }

    /// The workspace to address subjects with: identity workspace if
    /// authenticated, else the env-configured value, else `DEFAULT`.
    pub fn workspace_id(&self) -> String {
        if let Some(identity) = self.identity.read().as_ref() {
            return identity.workspace_id.clone();
        }
        self.env_workspace.clone().unwrap_or_else(|| "DEFAULT".into())
    }

    /// The executor tag stamped on call-tool responses: the runtime id when
    /// the identity nature is `runtime`, the literal `AGENT` otherwise.
    pub fn executed_by(&self) -> String {
        match self.identity.read().as_ref() {
            Some(identity) if identity.nature == IdentityNature::Runtime => identity.id.clone(),
            _ => "AGENT".into(),
        }
    }
}

/// One handshake request-reply on the well-known control subject.
pub async fn handshake_on(
    bus: &dyn Bus,
    key: &str,
    nature: IdentityNature,
    name: Option<&str>,
) -> Result<HandshakeOk> {
    let request = HandshakeRequest {
        key: key.into(),
        nature,
        name: name.map(str::to_string),
        pid: std::process::id(),
        host_ip: local_ip(),
        hostname: hostname(),
    };
    let payload = serde_json::to_vec(&request)?;

    let raw = bus
        .request(subjects::HANDSHAKE, payload, HANDSHAKE_TIMEOUT)
        .await
        .map_err(|e| Error::AuthFailed(format!("handshake: {e}")))?;

    let response: HandshakeResponse = serde_json::from_slice(&raw)
        .map_err(|e| Error::AuthFailed(format!("handshake response malformed: {e}")))?;

    match response {
        HandshakeResponse::Ok {
            id,
            workspace_id,
            name,
            access_token,
            bus_jwt,
        } => Ok(HandshakeOk {
            id,
            workspace_id,
            name,
            access_token,
            bus_jwt,
        }),
        HandshakeResponse::Error { message } => Err(Error::AuthFailed(message)),
    }
}

/// The successful half of a handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeOk {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub access_token: Option<String>,
    pub bus_jwt: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
