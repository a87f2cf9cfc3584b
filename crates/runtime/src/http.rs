//! HTTP host.
//!
//! One shared axum server exposes both consumer transports: SSE
//! (`GET /sse` + `POST|DELETE /messages`) and streamable (`/mcp`). Every
//! request passes origin, protocol-version, and Accept validation before a
//! handler does any session work. CORS headers are applied by a shared
//! layer so they are present even when a transport writes its own response.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};

use tm_domain::Config;

use crate::sessions::mcp::{frame_kind, is_initialize_request, FrameKind};
use crate::sessions::{AuthHeaders, SessionManager, TransportFlavor};
use crate::state::AppState;

/// Protocol versions this host accepts on `mcp-protocol-version`.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Assumed when the client sends no `mcp-protocol-version` header.
pub const LEGACY_PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_ID_HEADER: &str = "mcp-session-id";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);
    Router::new()
        .route("/mcp", get(mcp_get).post(mcp_post).delete(mcp_delete))
        .route("/sse", get(sse_get))
        .route("/messages", axum::routing::post(messages_post).delete(messages_delete))
        .layer(cors)
        .with_state(state)
}

/// CORS from `MCP_ALLOWED_ORIGINS`; loopback-only when unset. The
/// `mcp-session-id` header must be readable by browser clients.
fn build_cors_layer(config: &Config) -> CorsLayer {
    let allow_origin = if config.allowed_origins.is_empty() {
        AllowOrigin::predicate(|origin, _| {
            origin.to_str().map(is_loopback_origin).unwrap_or(false)
        })
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static(SESSION_ID_HEADER),
            header::HeaderName::from_static("mcp-protocol-version"),
            header::HeaderName::from_static("master_key"),
            header::HeaderName::from_static("toolset_key"),
            header::HeaderName::from_static("toolset_name"),
            header::HeaderName::from_static("skill_key"),
        ])
        .expose_headers([header::HeaderName::from_static(SESSION_ID_HEADER)])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Is this origin string a loopback host (any port)?
pub fn is_loopback_origin(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"));
    let Some(rest) = rest else { return false };
    // Bracketed IPv6 hosts carry colons of their own.
    let host = if rest.starts_with('[') {
        match rest.find(']') {
            Some(end) => &rest[..=end],
            None => return false,
        }
    } else {
        rest.split(':').next().unwrap_or(rest)
    };
    host == "localhost" || host == "127.0.0.1" || host == "[::1]"
}

/// DNS-rebinding defense: when enabled, a browser-supplied `Origin` must be
/// on the allowlist (or loopback when no allowlist is configured).
/// Requests without an `Origin` header are non-browser clients and pass.
pub fn origin_allowed(headers: &HeaderMap, config: &Config) -> bool {
    if !config.prevent_dns_rebinding {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if config.allowed_origins.is_empty() {
        is_loopback_origin(origin)
    } else {
        config.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

/// `mcp-protocol-version`: absent means the legacy version; an unsupported
/// value is refused.
pub fn protocol_version_ok(headers: &HeaderMap) -> std::result::Result<&'static str, String> {
    match headers.get("mcp-protocol-version").map(|v| v.to_str()) {
        None => Ok(LEGACY_PROTOCOL_VERSION),
        Some(Ok(version)) => SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|supported| **supported == version)
            .copied()
            .ok_or_else(|| format!("unsupported protocol version: {version}")),
        Some(Err(_)) => Err("unreadable protocol version header".into()),
    }
}

pub fn accept_includes(headers: &HeaderMap, needle: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(needle) || accept.contains("*/*"))
        .unwrap_or(false)
}

fn refuse(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// The validations shared by every HTTP handler; `Err` is the final
/// response.
fn validate_common(headers: &HeaderMap, config: &Config) -> std::result::Result<(), Response> {
    if !origin_allowed(headers, config) {
        return Err(refuse(StatusCode::FORBIDDEN, "origin not allowed"));
    }
    if let Err(message) = protocol_version_ok(headers) {
        return Err(refuse(StatusCode::BAD_REQUEST, &message));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamable transport (/mcp)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    if !accept_includes(&headers, "application/json")
        && !accept_includes(&headers, "text/event-stream")
    {
        return refuse(
            StatusCode::NOT_ACCEPTABLE,
            "Accept must include application/json or text/event-stream",
        );
    }

    let frame: Value = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(_) => return refuse(StatusCode::BAD_REQUEST, "body is not valid JSON"),
    };

    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match session_header {
        None => mcp_begin_session(&state, &headers, frame).await,
        Some(session_id) => mcp_existing_session(&state, &session_id, frame).await,
    }
}

/// POST without a session header: only an `initialize` request may begin a
/// new session.
async fn mcp_begin_session(state: &AppState, headers: &HeaderMap, frame: Value) -> Response {
    if !is_initialize_request(&frame) {
        return refuse(
            StatusCode::BAD_REQUEST,
            "no session: send an initialize request to begin one",
        );
    }

    let auth = AuthHeaders::from_header_map(headers);
    let identity = match state.sessions.authenticate(&auth).await {
        Ok(identity) => identity,
        Err(e) => {
            // Auth failures on streamable are a JSON-RPC error envelope,
            // not an HTTP failure.
            let id = frame.get("id").cloned().unwrap_or(Value::Null);
            let envelope = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32000, "message": e.to_string() }
            });
            return (StatusCode::OK, Json(envelope)).into_response();
        }
    };

    let entry = match state
        .sessions
        .open_session(TransportFlavor::Streamable, identity)
        .await
    {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!(error = %e, "failed to open streamable session");
            return refuse(StatusCode::INTERNAL_SERVER_ERROR, "failed to open session");
        }
    };

    let Some(session) = entry.session() else {
        return refuse(StatusCode::INTERNAL_SERVER_ERROR, "session not ready");
    };
    let response_frame = session.handle_frame(frame).await.unwrap_or(Value::Null);

    let mut response = (StatusCode::OK, Json(response_frame)).into_response();
    if let Ok(value) = HeaderValue::from_str(&entry.id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

async fn mcp_existing_session(state: &AppState, session_id: &str, frame: Value) -> Response {
    let Some(entry) = state.sessions.get(session_id) else {
        return refuse(
            StatusCode::NOT_FOUND,
            "session not found: re-initialize to obtain a new session id",
        );
    };
    let Some(session) = entry.session() else {
        return refuse(
            StatusCode::NOT_FOUND,
            "session not ready: re-initialize to obtain a new session id",
        );
    };

    match frame_kind(&frame) {
        // Client responses and notifications are accepted without a body.
        FrameKind::Response | FrameKind::Notification => {
            session.handle_frame(frame).await;
            StatusCode::ACCEPTED.into_response()
        }
        FrameKind::Request => {
            let response_frame = session.handle_frame(frame).await.unwrap_or(Value::Null);
            (StatusCode::OK, Json(response_frame)).into_response()
        }
    }
}

/// Listen-only stream for server→client frames of an existing session.
async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    if !accept_includes(&headers, "text/event-stream") {
        return refuse(StatusCode::NOT_ACCEPTABLE, "Accept must include text/event-stream");
    }
    let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return refuse(StatusCode::BAD_REQUEST, "mcp-session-id header required");
    };
    let Some(entry) = state.sessions.get(session_id) else {
        return refuse(StatusCode::NOT_FOUND, "session not found");
    };
    let Some(mut outbound) = entry.take_outbound() else {
        return refuse(StatusCode::BAD_REQUEST, "listen stream already open");
    };

    let stream = async_stream::stream! {
        while let Some(frame) = outbound.recv().await {
            yield Ok::<Event, Infallible>(Event::default().event("message").data(frame.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return refuse(StatusCode::BAD_REQUEST, "mcp-session-id header required");
    };
    if state.sessions.get(session_id).is_none() {
        return refuse(StatusCode::NOT_FOUND, "session not found");
    }
    state.sessions.close_session(session_id);
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport (/sse + /messages)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closing the raw response tears the session down.
struct SessionCloseGuard {
    manager: Arc<SessionManager>,
    session_id: String,
}

impl Drop for SessionCloseGuard {
    fn drop(&mut self) {
        self.manager.close_session(&self.session_id);
    }
}

async fn sse_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    if !accept_includes(&headers, "text/event-stream") {
        return refuse(StatusCode::NOT_ACCEPTABLE, "Accept must include text/event-stream");
    }

    let auth = AuthHeaders::from_header_map(&headers);
    let identity = match state.sessions.authenticate(&auth).await {
        Ok(identity) => identity,
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let entry = match state.sessions.open_session(TransportFlavor::Sse, identity).await {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!(error = %e, "failed to open SSE session");
            return refuse(StatusCode::INTERNAL_SERVER_ERROR, "failed to open session");
        }
    };
    let Some(mut outbound) = entry.take_outbound() else {
        return refuse(StatusCode::INTERNAL_SERVER_ERROR, "session stream unavailable");
    };

    let session_id = entry.id.clone();
    let manager = state.sessions.clone();
    let stream = async_stream::stream! {
        let _guard = SessionCloseGuard {
            manager,
            session_id: session_id.clone(),
        };
        // First event tells the client where to POST its frames.
        yield Ok::<Event, Infallible>(
            Event::default()
                .event("endpoint")
                .data(format!("/messages?sessionId={session_id}")),
        );
        while let Some(frame) = outbound.recv().await {
            yield Ok(Event::default().event("message").data(frame.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn messages_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    if state.config.validate_accept_header && !accept_includes(&headers, "application/json") {
        return refuse(StatusCode::NOT_ACCEPTABLE, "Accept must include application/json");
    }
    let Some(session_id) = query.session_id else {
        return refuse(StatusCode::BAD_REQUEST, "sessionId query parameter required");
    };
    let Some(entry) = state.sessions.get(&session_id) else {
        return refuse(StatusCode::NOT_FOUND, "session not found");
    };
    if entry.flavor != TransportFlavor::Sse {
        return refuse(StatusCode::BAD_REQUEST, "session is not an SSE session");
    }
    let Some(session) = entry.session() else {
        return refuse(StatusCode::NOT_FOUND, "session not ready");
    };

    let frame: Value = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(_) => return refuse(StatusCode::BAD_REQUEST, "body is not valid JSON"),
    };

    // Responses travel back over the SSE stream, not this POST.
    if let Some(response_frame) = session.handle_frame(frame).await {
        if entry.outbound().send(response_frame).await.is_err() {
            tracing::warn!(session_id = %session_id, "SSE stream gone, dropping response");
        }
    }
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

async fn messages_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Response {
    if let Err(response) = validate_common(&headers, &state.config) {
        return response;
    }
    let Some(session_id) = query.session_id else {
        return refuse(StatusCode::BAD_REQUEST, "sessionId query parameter required");
    };
    if state.sessions.get(&session_id).is_none() {
        return refuse(StatusCode::NOT_FOUND, "session not found");
    }
    state.sessions.close_session(&session_id);
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(origins: &[&str], rebinding: bool) -> Config {
        Config {
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            prevent_dns_rebinding: rebinding,
            ..Config::default()
        }
    }

    #[test]
    fn loopback_origin_detection() {
        assert!(is_loopback_origin("http://localhost:3000"));
        assert!(is_loopback_origin("http://127.0.0.1"));
        assert!(is_loopback_origin("https://localhost"));
        assert!(is_loopback_origin("http://[::1]:3000"));
        assert!(!is_loopback_origin("http://localhost.evil.com"));
        assert!(!is_loopback_origin("https://evil.example"));
        assert!(!is_loopback_origin("localhost"));
    }

    #[test]
    fn origin_allowlist_is_exact() {
        let config = config_with(&["https://app.example"], true);
        let mut headers = HeaderMap::new();

        headers.insert(header::ORIGIN, "https://evil.example".parse().unwrap());
        assert!(!origin_allowed(&headers, &config));

        headers.insert(header::ORIGIN, "https://app.example".parse().unwrap());
        assert!(origin_allowed(&headers, &config));
    }

    #[test]
    fn missing_origin_passes() {
        let config = config_with(&["https://app.example"], true);
        assert!(origin_allowed(&HeaderMap::new(), &config));
    }

    #[test]
    fn rebinding_defense_can_be_disabled() {
        let config = config_with(&[], false);
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://evil.example".parse().unwrap());
        assert!(origin_allowed(&headers, &config));
    }

    #[test]
    fn protocol_version_defaults_to_legacy() {
        assert_eq!(protocol_version_ok(&HeaderMap::new()).unwrap(), LEGACY_PROTOCOL_VERSION);

        let mut headers = HeaderMap::new();
        headers.insert("mcp-protocol-version", "2024-11-05".parse().unwrap());
        assert_eq!(protocol_version_ok(&headers).unwrap(), "2024-11-05");

        headers.insert("mcp-protocol-version", "1999-01-01".parse().unwrap());
        assert!(protocol_version_ok(&headers).is_err());
    }

    #[test]
    fn accept_matching() {
        let mut headers = HeaderMap::new();
        assert!(!accept_includes(&headers, "text/event-stream"));

        headers.insert(header::ACCEPT, "application/json, text/event-stream".parse().unwrap());
        assert!(accept_includes(&headers, "text/event-stream"));
        assert!(accept_includes(&headers, "application/json"));

        headers.insert(header::ACCEPT, "*/*".parse().unwrap());
        assert!(accept_includes(&headers, "text/event-stream"));
    }
}
