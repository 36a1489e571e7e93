//! Axum route tree. Grounded on the teacher's `server.rs` (health check,
//! permissive CORS layer, `app()`/`serve()`/`spawn()` shape) with the
//! projects/tools/autoconfig/install-log routes dropped — spec.md §6 names
//! exactly three inbound wire protocols and a health check.

use axum::{
    extract::Path,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::gateway_error::GatewayError;
use crate::model::Platform;
use crate::orchestrator::{self, OrchestrateRequest};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn session_fingerprint(headers: &HeaderMap) -> Option<String> {
    headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

/// Shared plumbing for all three inbound routes: authenticate, resolve
/// model/streaming (from the body unless the caller already knows them, as
/// Gemini's `:action` path suffix does), and hand off to the orchestrator.
async fn handle_inbound(headers: HeaderMap, client_protocol: Platform, body: Value, model_override: Option<(String, bool)>) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return crate::gateway_error::into_response_for(GatewayError::Auth("missing bearer token".to_string()), client_protocol);
    };
    let Some(user) = crate::users::authenticate(token) else {
        return crate::gateway_error::into_response_for(GatewayError::Auth("invalid api key".to_string()), client_protocol);
    };

    let (model, streaming) = match model_override {
        Some(pair) => pair,
        None => {
            let model = body.get("model").and_then(|v| v.as_str()).map(|s| s.to_string());
            let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
            match model {
                Some(m) => (m, streaming),
                None => {
                    return crate::gateway_error::into_response_for(
                        GatewayError::UserInput("request body missing \"model\"".to_string()),
                        client_protocol,
                    )
                }
            }
        }
    };

    let fingerprint = session_fingerprint(&headers);
    let req = OrchestrateRequest {
        user: &user,
        client_protocol,
        model: &model,
        streaming,
        body,
        session_fingerprint: fingerprint.as_deref(),
        group_id: None,
    };

    match orchestrator::handle(req).await {
        Ok(response) => response,
        Err(e) => crate::gateway_error::into_response_for(e, client_protocol),
    }
}

async fn anthropic_messages(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_inbound(headers, Platform::Anthropic, body, None).await
}

async fn openai_chat_completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_inbound(headers, Platform::Openai, body, None).await
}

/// Path captures the whole `{model}:{action}` segment since it contains no
/// slash (e.g. `gemini-3-pro:streamGenerateContent`).
async fn gemini_generate(headers: HeaderMap, Path(model_action): Path<String>, Json(body): Json<Value>) -> Response {
    let (model, action) = model_action.split_once(':').unwrap_or((model_action.as_str(), "generateContent"));
    let streaming = action == "streamGenerateContent";
    handle_inbound(headers, Platform::Gemini, body, Some((model.to_string(), streaming))).await
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(health))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1beta/models/:model_action", post(gemini_generate))
        .layer(cors)
}

pub async fn serve() {
    let app = app();
    let port: u16 = std::env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8787);
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    crate::logger::info("server", &format!("listening on {addr}"));
    axum::serve(listener, app).await.unwrap();
}

pub fn spawn() {
    tokio::spawn(async move { serve().await });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let url = format!("http://{addr}");
        let r = reqwest::get(format!("{url}/health")).await.unwrap();
        let s = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(s["status"], "ok");
        drop(h);
    }

    #[tokio::test]
    async fn messages_without_bearer_token_is_unauthorized() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let url = format!("http://{addr}");
        let client = reqwest::Client::new();
        let r = client
            .post(format!("{url}/v1/messages"))
            .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 401);
        drop(h);
    }
}
