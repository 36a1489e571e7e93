//! SSE pump: line-buffered read from the upstream byte stream, re-emitted in
//! the target protocol. Grounded on `forward::client::drain_sse_lines` (line
//! buffering across chunk boundaries) generalized here to also translate
//! each payload and track `first_token_ms`.

use futures_util::StreamExt;
use reqwest::Response;
use serde_json::Value;
use std::time::Instant;

use crate::gateway_error::GatewayError;
use crate::model::{Platform, TokenUsage};

use super::{antigravity, translate};

pub struct StreamOutcome {
    pub usage: TokenUsage,
    pub first_token_ms: Option<u64>,
    /// Concatenation of every `data:` payload re-emitted to the client, in
    /// the target protocol's wire shape (spec.md §8 R2).
    pub body: Vec<u8>,
}

/// Pumps an upstream SSE response, translating each `data:` line from the
/// account's platform shape into the client's requested shape, and
/// accumulating usage + first-token timing. Returns the full translated SSE
/// byte stream (the caller wraps it in an axum streaming body).
pub async fn pump(
    response: Response,
    account_platform: Platform,
    client_protocol: Platform,
    model: &str,
    is_antigravity: bool,
) -> Result<StreamOutcome, GatewayError> {
    let start = Instant::now();
    let mut buffer: Vec<u8> = Vec::new();
    let mut out: Vec<u8> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut first_token_ms: Option<u64> = None;

    let mut byte_stream = response.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::UpstreamTransient(format!("stream read error: {e}")))?;
        for line in crate::http_client::drain_sse_lines(&mut buffer, &chunk) {
            let Some(data) = crate::http_client::parse_sse_data(&line) else { continue };
            if crate::http_client::is_sse_done(data) {
                continue;
            }
            let trimmed = data.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(mut payload) = serde_json::from_str::<Value>(trimmed) else { continue };
            if is_antigravity {
                payload = antigravity::unwrap_response(&payload);
            }

            if first_token_ms.is_none() {
                first_token_ms = Some(start.elapsed().as_millis() as u64);
            }

            let chunk_usage = match account_platform {
                Platform::Gemini | Platform::Antigravity => translate::extract_usage_gemini(&payload),
                _ => translate::extract_usage_anthropic(&payload),
            };
            if chunk_usage.total() > 0 {
                usage = chunk_usage;
            }

            let translated = translate_chunk(&payload, account_platform, client_protocol, model);
            out.extend_from_slice(format!("data: {translated}\n\n").as_bytes());
        }
    }

    if client_protocol == Platform::Anthropic && account_platform != Platform::Anthropic {
        out.extend_from_slice(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    } else if client_protocol == Platform::Openai {
        out.extend_from_slice(b"data: [DONE]\n\n");
    }

    Ok(StreamOutcome { usage, first_token_ms, body: out })
}

fn translate_chunk(payload: &Value, account_platform: Platform, client_protocol: Platform, model: &str) -> Value {
    match (account_platform, client_protocol) {
        (Platform::Gemini, Platform::Anthropic) | (Platform::Antigravity, Platform::Anthropic) => {
            translate::gemini_response_to_anthropic(payload, model)
        }
        _ => payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_chunk_passthrough_for_matching_protocols() {
        let payload = serde_json::json!({ "type": "content_block_delta" });
        let out = translate_chunk(&payload, Platform::Anthropic, Platform::Anthropic, "m");
        assert_eq!(out, payload);
    }

    #[test]
    fn translate_chunk_converts_gemini_to_anthropic() {
        let payload = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "hi" }] }, "finishReason": "STOP" }]
        });
        let out = translate_chunk(&payload, Platform::Gemini, Platform::Anthropic, "claude-sonnet-4-5");
        assert_eq!(out["content"][0]["text"], "hi");
    }
}
