//! C11 — streaming forwarder: `forward(account, client_protocol, token,
//! model, streaming, body) -> (response, outcome)`, spec.md §4.7.
//!
//! The retry/failover state machine and endpoint round-robin are grounded on
//! `forward::client::send_with_retry`; the protocol translation matrix and
//! the antigravity envelope are new (the teacher forwards only between its
//! own `Upstream` definitions, never between wire protocols).

pub mod antigravity;
pub mod stream;
pub mod translate;

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};
use serde_json::Value;

use crate::gateway_error::GatewayError;
use crate::model::{Account, Platform, TokenUsage};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(16);
const NON_STREAMING_CAP_BYTES: usize = 8 * 1024 * 1024;

pub struct ForwardOutcome {
    pub usage: TokenUsage,
    pub model: String,
    pub streamed: bool,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    pub request_id: String,
}

fn build_upstream_body(account: &Account, client_protocol: Platform, effective_model: &str, request_body: &Value) -> Value {
    match account.platform {
        Platform::Antigravity => {
            let translated = match client_protocol {
                Platform::Anthropic => translate::anthropic_request_to_gemini(request_body),
                _ => request_body.clone(),
            };
            let project = account.credentials.get_str("project_id").unwrap_or_default();
            antigravity::wrap_envelope(&project, effective_model, translated)
        }
        _ => {
            let mut body = request_body.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String(effective_model.to_string()));
            }
            body
        }
    }
}

fn upstream_path(platform: Platform, model: &str, streaming: bool) -> String {
    match platform {
        Platform::Anthropic => "/v1/messages".to_string(),
        Platform::Openai => "/v1/chat/completions".to_string(),
        Platform::Gemini => {
            let action = if streaming { "streamGenerateContent" } else { "generateContent" };
            format!("/v1beta/models/{model}:{action}")
        }
        Platform::Antigravity => {
            let action = if streaming { "streamGenerateContent" } else { "generateContent" };
            format!("/v1internal/{action}")
        }
    }
}

fn build_headers(account: &Account, token: &str, request_id: &str) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-request-id",
        HeaderValue::from_str(request_id).map_err(|e| GatewayError::Internal(e.to_string()))?,
    );
    match account.platform {
        Platform::Anthropic => {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(token).map_err(|e| GatewayError::Internal(e.to_string()))?,
            );
            headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        }
        _ => {
            let value = format!("Bearer {token}");
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|e| GatewayError::Internal(e.to_string()))?,
            );
        }
    }
    Ok(headers)
}

async fn read_capped(response: reqwest::Response, cap: usize) -> Result<Vec<u8>, GatewayError> {
    use futures_util::StreamExt;
    let mut out = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::UpstreamTransient(format!("body read error: {e}")))?;
        if out.len() + chunk.len() > cap {
            return Err(GatewayError::UpstreamTransient("response exceeded 8MiB cap".to_string()));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

fn extract_usage(account_platform: Platform, client_protocol: Platform, body: &Value) -> TokenUsage {
    match account_platform {
        Platform::Antigravity => translate::extract_usage_gemini(body),
        Platform::Gemini => translate::extract_usage_gemini(body),
        Platform::Openai => translate::extract_usage_openai(body),
        Platform::Anthropic => match client_protocol {
            Platform::Openai => translate::extract_usage_openai(body),
            _ => translate::extract_usage_anthropic(body),
        },
    }
}

async fn finish_non_streaming(
    response: reqwest::Response,
    account: &Account,
    client_protocol: Platform,
    effective_model: &str,
    request_id: String,
    start: Instant,
) -> Result<(Response, ForwardOutcome), GatewayError> {
    let bytes = read_capped(response, NON_STREAMING_CAP_BYTES).await?;
    let raw: Value = serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::UpstreamTransient(format!("invalid upstream JSON: {e}")))?;

    let (translated, usage) = if account.platform == Platform::Antigravity {
        let unwrapped = antigravity::unwrap_response(&raw);
        let usage = translate::extract_usage_gemini(&unwrapped);
        let translated = match client_protocol {
            Platform::Anthropic => translate::gemini_response_to_anthropic(&unwrapped, effective_model),
            _ => unwrapped,
        };
        (translated, usage)
    } else {
        let usage = extract_usage(account.platform, client_protocol, &raw);
        (raw, usage)
    };

    let body_bytes = serde_json::to_vec(&translated).map_err(|e| GatewayError::Internal(e.to_string()))?;
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", request_id.clone())
        .body(Body::from(body_bytes))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    Ok((
        response,
        ForwardOutcome {
            usage,
            model: effective_model.to_string(),
            streamed: false,
            duration_ms: start.elapsed().as_millis() as u64,
            first_token_ms: None,
            request_id,
        },
    ))
}

async fn finish_streaming(
    response: reqwest::Response,
    account: &Account,
    client_protocol: Platform,
    effective_model: &str,
    request_id: String,
    start: Instant,
) -> Result<(Response, ForwardOutcome), GatewayError> {
    let is_antigravity = account.platform == Platform::Antigravity;
    let outcome = stream::pump(response, account.platform, client_protocol, effective_model, is_antigravity).await?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .header("x-request-id", request_id.clone())
        .body(Body::from(outcome.body))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    Ok((
        response,
        ForwardOutcome {
            usage: outcome.usage,
            model: effective_model.to_string(),
            streamed: true,
            duration_ms: start.elapsed().as_millis() as u64,
            first_token_ms: outcome.first_token_ms,
            request_id,
        },
    ))
}

/// The C11 contract. Runs the retry/failover state machine for one
/// scheduling attempt; on failover-worthy exhaustion returns
/// `GatewayError::UpstreamFailover` for the orchestrator to catch.
pub async fn forward(
    account: &Account,
    client_protocol: Platform,
    token: &str,
    model: &str,
    streaming: bool,
    request_body: Value,
) -> Result<(Response, ForwardOutcome), GatewayError> {
    let request_id = crate::concurrency::request_id();
    let start = Instant::now();
    let endpoints = account.endpoints();
    let client = if streaming { crate::http_client::streaming_client()? } else { crate::http_client::default_client()? };

    let effective_model = if account.platform == Platform::Antigravity {
        antigravity::map_model(account, model)
    } else {
        model.to_string()
    };

    let mut upstream_body = build_upstream_body(account, client_protocol, &effective_model, &request_body);
    let path = upstream_path(account.platform, &effective_model, streaming);
    let headers = build_headers(account, token, &request_id)?;

    let mut signature_retry_used = false;
    let mut model_fallback_used = false;
    let mut attempts = 0u32;
    let mut endpoint_idx = 0usize;

    loop {
        attempts += 1;
        let endpoint = &endpoints[endpoint_idx % endpoints.len()];
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

        let attempt = crate::http_client::make_request(&client, &url, headers.clone(), &upstream_body).await;

        let attempt = match attempt {
            Ok(a) => a,
            Err(_) if attempts < MAX_ATTEMPTS => {
                let delay = crate::clock::with_jitter(crate::clock::backoff_delay(attempts, BASE_DELAY, MAX_DELAY));
                tokio::time::sleep(delay).await;
                endpoint_idx += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let status = attempt.response.status();
        if status.is_success() {
            return if streaming {
                finish_streaming(attempt.response, account, client_protocol, &effective_model, request_id, start).await
            } else {
                finish_non_streaming(attempt.response, account, client_protocol, &effective_model, request_id, start).await
            };
        }

        let status_code = status.as_u16();
        let body_text = attempt.response.text().await.unwrap_or_default();

        if account.platform == Platform::Antigravity {
            if status_code == 400 && !signature_retry_used && translate::looks_signature_error(&body_text) {
                signature_retry_used = true;
                translate::strip_thinking_blocks(&mut upstream_body);
                continue;
            }
            if status_code == 404
                && !model_fallback_used
                && translate::looks_model_not_found(&body_text)
                && crate::config::load().enable_model_fallback.unwrap_or(false)
                && antigravity::default_model() != effective_model
            {
                model_fallback_used = true;
                upstream_body = build_upstream_body(account, client_protocol, antigravity::default_model(), &request_body);
                continue;
            }
        }

        let now = crate::clock::now_epoch_secs();
        let classification = crate::classifier::classify(account, crate::classifier::ClassifyInput { status_code, body: &body_text, now });
        crate::classifier::apply(account.id, classification, now).await;

        if crate::gateway_error::is_transient_status(status_code) && attempts < MAX_ATTEMPTS {
            let delay = crate::clock::with_jitter(crate::clock::backoff_delay(attempts, BASE_DELAY, MAX_DELAY));
            tokio::time::sleep(delay).await;
            endpoint_idx += 1;
            continue;
        }

        if crate::gateway_error::should_failover(status_code) {
            return Err(GatewayError::UpstreamFailover { status: status_code });
        }
        return Err(GatewayError::UpstreamClientError { status: status_code, body: body_text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountStatus, AccountType, Cooldowns, Credentials};
    use std::collections::HashMap;

    fn account(platform: Platform) -> Account {
        Account {
            id: 1,
            name: "a".into(),
            display_name: "a".into(),
            platform,
            account_type: AccountType::Apikey,
            credentials: Credentials(HashMap::new()),
            extra: HashMap::new(),
            proxy_id: None,
            group_id: None,
            concurrency: 1,
            priority: 0,
            status: AccountStatus::Active,
            schedulable: true,
            cooldowns: Cooldowns::default(),
            last_used_at: None,
        }
    }

    #[test]
    fn upstream_path_matches_provider_conventions() {
        assert_eq!(upstream_path(Platform::Anthropic, "claude-sonnet-4-5", false), "/v1/messages");
        assert_eq!(upstream_path(Platform::Openai, "gpt-4", false), "/v1/chat/completions");
        assert_eq!(upstream_path(Platform::Gemini, "gemini-3-pro", true), "/v1beta/models/gemini-3-pro:streamGenerateContent");
        assert_eq!(upstream_path(Platform::Antigravity, "claude-sonnet-4-5", false), "/v1internal/generateContent");
    }

    #[test]
    fn scenario_4_antigravity_wraps_anthropic_request_with_mapped_model() {
        let acc = account(Platform::Antigravity);
        let body = serde_json::json!({ "messages": [{ "role": "user", "content": "hi" }] });
        let effective_model = antigravity::map_model(&acc, "claude-3-5-sonnet-20241022");
        assert_eq!(effective_model, "claude-sonnet-4-5");
        let upstream = build_upstream_body(&acc, Platform::Anthropic, &effective_model, &body);
        assert_eq!(upstream["model"], "claude-sonnet-4-5");
        assert_eq!(upstream["requestType"], "agent");
        assert_eq!(upstream["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn non_antigravity_body_gets_model_substituted() {
        let acc = account(Platform::Anthropic);
        let body = serde_json::json!({ "messages": [] });
        let upstream = build_upstream_body(&acc, Platform::Anthropic, "claude-opus-4", &body);
        assert_eq!(upstream["model"], "claude-opus-4");
    }
}
