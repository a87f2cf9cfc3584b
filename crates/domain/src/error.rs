/// Shared error type used across all toolmesh crates.
///
/// The variants mirror the runtime's failure surfaces: auth and handshake,
/// desired-state validation, provider transports, tool routing, consumer
/// sessions, and HTTP request validation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("call failed: {0}")]
    CallFailed(String),

    #[error("session missing: {0}")]
    SessionMissing(String),

    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("origin refused: {0}")]
    OriginRefused(String),

    #[error("unsupported protocol version: {0}")]
    ProtocolUnsupported(String),

    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    #[error("bus: {0}")]
    Bus(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Unrecoverable startup failure (e.g. bus client loss). Everything
    /// else is per-call and localized.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
