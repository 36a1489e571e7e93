//! Error kinds carried through the request-dispatch core, per spec.md §7.
//!
//! Modeled on the teacher's `forward::error::ForwardError`: a flat enum with
//! a `Display` impl, an `IntoResponse` impl that logs every error on the way
//! out, and a JSON envelope shaped by the *client* protocol rather than the
//! upstream platform (Anthropic `{type, error:{type, message}}` vs Google
//! `{error:{code, status, message}}`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::model::Platform;

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Malformed request body or unsupported model. Surfaced verbatim to the
    /// client as 400.
    UserInput(String),
    /// Invalid/revoked credential, disabled user.
    Auth(String),
    /// `no_available_accounts`.
    Scheduling,
    /// User or account slot refused after the wait budget was exhausted.
    Concurrency,
    /// Token refresh failed. `recoverable = true` means the orchestrator
    /// should retry on another account; `false` means the account itself
    /// should be marked `error`.
    TokenRefresh { recoverable: bool, message: String },
    /// Retried per §4.7 and still failing; exposed only if retries are
    /// exhausted without a failover being possible.
    UpstreamTransient(String),
    /// Internal-only signal: re-schedule on a different account. Never sent
    /// to the client as-is; the orchestrator catches it.
    UpstreamFailover { status: u16 },
    /// Terminal upstream 4xx that is not itself a scheduling signal.
    UpstreamClientError { status: u16, body: String },
    Internal(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::UserInput(m) => write!(f, "invalid request: {m}"),
            GatewayError::Auth(m) => write!(f, "auth error: {m}"),
            GatewayError::Scheduling => write!(f, "no_available_accounts"),
            GatewayError::Concurrency => write!(f, "concurrency limit reached"),
            GatewayError::TokenRefresh { message, .. } => write!(f, "token refresh failed: {message}"),
            GatewayError::UpstreamTransient(m) => write!(f, "upstream transient error: {m}"),
            GatewayError::UpstreamFailover { status } => write!(f, "upstream failover (status {status})"),
            GatewayError::UpstreamClientError { status, body } => {
                write!(f, "upstream client error {status}: {body}")
            }
            GatewayError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Translates an error into the provider-shaped envelope spec.md §7 requires,
/// chosen by the inbound client protocol (never by the upstream platform —
/// antigravity's already-translated bodies are the one exception, handled
/// upstream of this function).
pub fn into_response_for(err: GatewayError, client_protocol: Platform) -> Response {
    let (status, error_type, message) = match &err {
        GatewayError::UserInput(m) => (StatusCode::BAD_REQUEST, "invalid_request_error", m.clone()),
        GatewayError::Auth(m) => (StatusCode::UNAUTHORIZED, "authentication_error", m.clone()),
        GatewayError::Scheduling => (
            StatusCode::SERVICE_UNAVAILABLE,
            "no_available_accounts",
            "no schedulable account for this request".to_string(),
        ),
        GatewayError::Concurrency => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "concurrency limit reached".to_string(),
        ),
        GatewayError::TokenRefresh { message, .. } => {
            (StatusCode::BAD_GATEWAY, "token_refresh_failed", message.clone())
        }
        GatewayError::UpstreamTransient(m) => (StatusCode::BAD_GATEWAY, "upstream_error", m.clone()),
        GatewayError::UpstreamFailover { status } => (
            StatusCode::BAD_GATEWAY,
            "upstream_failover",
            format!("upstream returned status {status}"),
        ),
        GatewayError::UpstreamClientError { status, body } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            "upstream_client_error",
            body.clone(),
        ),
        GatewayError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m.clone()),
    };

    crate::logger::error(
        "gateway_error",
        &format!("status={} type={} message={}", status.as_u16(), error_type, message),
    );

    let body = match client_protocol {
        Platform::Gemini => serde_json::json!({
            "error": { "code": status.as_u16(), "status": error_type, "message": message }
        }),
        _ => serde_json::json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        }),
    };

    (status, Json(body)).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        into_response_for(self, Platform::Anthropic)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// spec.md §4.7 transient/fatal classification, reused by both the retry
/// loop (C10/C11) and `should_failover` below.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// spec.md §4.7 "after exhaustion, if should_failover(status) = true...".
pub fn should_failover(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || (500..600).contains(&status)
}
