//! Protocol translation matrix (spec.md §4.7): Anthropic Messages ⇄ Gemini
//! generateContent content-block conversion, and usage extraction in both
//! shapes. Grounded on the teacher's `forward::handlers::gemini`'s
//! `handle_gemini_to_anthropic_request`/`handle_anthropic_to_gemini_request`
//! naming and role/content-block mapping, rewritten against `model::Account`
//! and `model::TokenUsage` instead of the teacher's `Upstream`/`TokenUsage`.

use serde_json::{json, Map, Value};

use crate::model::TokenUsage;

fn anthropic_role_to_gemini(role: &str) -> &'static str {
    if role == "assistant" {
        "model"
    } else {
        "user"
    }
}

fn gemini_role_to_anthropic(role: &str) -> &'static str {
    if role == "model" {
        "assistant"
    } else {
        "user"
    }
}

/// One content block, normalized across both protocols' shapes.
enum Block {
    Text(String),
    Thinking(String),
    RedactedThinking,
    Other(Value),
}

fn parse_anthropic_blocks(content: &Value) -> Vec<Block> {
    match content {
        Value::String(s) => vec![Block::Text(s.clone())],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let Some(obj) = item.as_object() else { return Block::Other(item.clone()) };
                match obj.get("type").and_then(|v| v.as_str()) {
                    Some("text") => Block::Text(obj.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string()),
                    Some("thinking") => Block::Thinking(obj.get("thinking").and_then(|v| v.as_str()).unwrap_or_default().to_string()),
                    Some("redacted_thinking") => Block::RedactedThinking,
                    _ => Block::Other(item.clone()),
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn blocks_to_gemini_parts(blocks: &[Block]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            Block::Text(t) => Some(json!({ "text": t })),
            Block::Thinking(t) => Some(json!({ "text": t })),
            Block::RedactedThinking => None,
            Block::Other(_) => None,
        })
        .collect()
}

/// Translates an Anthropic Messages request body into a Gemini
/// `generateContent` request. System prompt moves to `systemInstruction`;
/// `max_tokens`/`temperature` map to `generationConfig`.
pub fn anthropic_request_to_gemini(body: &Value) -> Value {
    let mut contents = Vec::new();

    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for msg in messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let blocks = parse_anthropic_blocks(msg.get("content").unwrap_or(&Value::Null));
            contents.push(json!({
                "role": anthropic_role_to_gemini(role),
                "parts": blocks_to_gemini_parts(&blocks),
            }));
        }
    }

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));

    if let Some(system) = body.get("system") {
        let blocks = parse_anthropic_blocks(system);
        let parts = blocks_to_gemini_parts(&blocks);
        if !parts.is_empty() {
            out.insert("systemInstruction".to_string(), json!({ "parts": parts }));
        }
    }

    let mut gen_cfg = Map::new();
    if let Some(max_tokens) = body.get("max_tokens") {
        gen_cfg.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if let Some(temp) = body.get("temperature") {
        gen_cfg.insert("temperature".to_string(), temp.clone());
    }
    if !gen_cfg.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(gen_cfg));
    }

    Value::Object(out)
}

/// Translates a complete (non-streaming) Gemini response into an Anthropic
/// Messages response shape.
pub fn gemini_response_to_anthropic(body: &Value, model: &str) -> Value {
    let text = body
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = extract_usage_gemini(body);
    let stop_reason = body
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop");

    json!({
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": text }],
        "stop_reason": if stop_reason == "STOP" { "end_turn" } else { "max_tokens" },
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_creation_input_tokens": usage.cache_creation_input_tokens,
            "cache_read_input_tokens": usage.cache_read_input_tokens,
        },
    })
}

pub fn extract_usage_gemini(body: &Value) -> TokenUsage {
    let Some(meta) = body.get("usageMetadata") else { return TokenUsage::default() };
    TokenUsage {
        input_tokens: meta.get("promptTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: meta.get("candidatesTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: meta.get("cachedContentTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
    }
}

pub fn extract_usage_openai(body: &Value) -> TokenUsage {
    let Some(usage) = body.get("usage") else { return TokenUsage::default() };
    TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: usage.get("completion_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: 0,
    }
}

pub fn extract_usage_anthropic(body: &Value) -> TokenUsage {
    let Some(usage) = body.get("usage") else { return TokenUsage::default() };
    TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        cache_creation_input_tokens: usage.get("cache_creation_input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        cache_read_input_tokens: usage.get("cache_read_input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
    }
}

/// spec.md §4.7 "signature-error single retry": rewrite `thinking` blocks to
/// plain `text` (content preserved), drop `redacted_thinking` blocks, clear
/// any top-level `thinking` field. Mutates `body` in place.
pub fn strip_thinking_blocks(body: &mut Value) {
    body.as_object_mut().map(|obj| obj.remove("thinking"));

    let Some(messages) = body.get_mut("messages").and_then(|v| v.as_array_mut()) else { return };
    for msg in messages {
        let Some(content) = msg.get_mut("content") else { continue };
        let Some(items) = content.as_array_mut() else { continue };
        let rewritten: Vec<Value> = items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                match obj.get("type").and_then(|v| v.as_str()) {
                    Some("redacted_thinking") => None,
                    Some("thinking") => {
                        let text = obj.get("thinking").and_then(|v| v.as_str()).unwrap_or_default();
                        Some(json!({ "type": "text", "text": text }))
                    }
                    _ => Some(item.clone()),
                }
            })
            .collect();
        *content = Value::Array(rewritten);
    }
}

/// Whether a response body looks like an antigravity "model not found" error
/// (spec.md §4.7 "model-not-found fallback").
pub fn looks_model_not_found(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("model") && (lower.contains("not found") || lower.contains("not_found") || lower.contains("unsupported"))
}

/// Whether a response body indicates the antigravity signature-retry path
/// should fire (spec.md §4.7 "signature-error single retry").
pub fn looks_signature_error(body: &str) -> bool {
    body.contains("thought_signature") || body.contains("signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_text_message_becomes_gemini_content() {
        let body = json!({
            "messages": [{ "role": "user", "content": "hello" }],
            "system": "be terse",
        });
        let gemini = anthropic_request_to_gemini(&body);
        assert_eq!(gemini["contents"][0]["role"], "user");
        assert_eq!(gemini["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(gemini["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn round_trip_preserves_text_r1() {
        let anthropic_req = json!({ "messages": [{ "role": "user", "content": "what is 2+2?" }] });
        let gemini_req = anthropic_request_to_gemini(&anthropic_req);
        assert_eq!(gemini_req["contents"][0]["parts"][0]["text"], "what is 2+2?");

        let gemini_resp = json!({
            "candidates": [{ "content": { "parts": [{ "text": "4" }] }, "finishReason": "STOP" }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 1 },
        });
        let anthropic_resp = gemini_response_to_anthropic(&gemini_resp, "claude-sonnet-4-5");
        assert_eq!(anthropic_resp["content"][0]["text"], "4");
    }

    #[test]
    fn strip_thinking_converts_to_text_and_drops_redacted() {
        let mut body = json!({
            "thinking": { "type": "enabled", "budget_tokens": 1024 },
            "messages": [{
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "reasoning here" },
                    { "type": "redacted_thinking", "data": "opaque" },
                    { "type": "text", "text": "final answer" },
                ]
            }]
        });
        strip_thinking_blocks(&mut body);
        assert!(body.get("thinking").is_none());
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "reasoning here");
        assert_eq!(content[1]["text"], "final answer");
    }

    #[test]
    fn gemini_role_names_map_both_ways() {
        assert_eq!(anthropic_role_to_gemini("assistant"), "model");
        assert_eq!(gemini_role_to_anthropic("model"), "assistant");
    }
}
