//! Antigravity v1internal envelope and model mapping (spec.md §4.7). The
//! teacher has no antigravity concept at all; this is built fresh, in the
//! same free-function-over-`serde_json::Value` style `forward::client`
//! already uses for wire-format shaping.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::model::Account;

/// `{ project, requestId = "agent-" + uuid4, userAgent, requestType =
/// "agent", model, request: <original> }`.
pub fn wrap_envelope(project: &str, model: &str, request: Value) -> Value {
    json!({
        "project": project,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "userAgent": "llm-gateway",
        "requestType": "agent",
        "model": model,
        "request": request,
    })
}

/// Antigravity responses are unwrapped by extracting the `response` key;
/// bodies that aren't wrapped (already-unwrapped errors) pass through.
pub fn unwrap_response(body: &Value) -> Value {
    body.get("response").cloned().unwrap_or_else(|| body.clone())
}

const PREFIX_MAPPINGS: &[(&str, &str)] = &[
    ("claude-3-5-sonnet", "claude-sonnet-4-5"),
    ("claude-haiku-4", "gemini-3-flash"),
    ("gemini-2.5-flash-image", "gemini-3-pro-image"),
];

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Model mapping precedence chain per spec.md §4.7: account `model_mapping`
/// entry → direct passthrough if already supported → longest-prefix mapping
/// table → generic `gemini-*` passthrough → default.
pub fn map_model(account: &Account, requested: &str) -> String {
    if let Some(mapping) = account.model_mapping() {
        if let Some(mapped) = mapping.get(requested).and_then(|v| v.as_str()) {
            return mapped.to_string();
        }
    }

    if is_model_supported(requested) && !PREFIX_MAPPINGS.iter().any(|(prefix, _)| requested.starts_with(prefix)) {
        return requested.to_string();
    }

    let longest = PREFIX_MAPPINGS
        .iter()
        .filter(|(prefix, _)| requested.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len());
    if let Some((_, mapped)) = longest {
        return mapped.to_string();
    }

    if requested.starts_with("gemini-") {
        return requested.to_string();
    }

    DEFAULT_MODEL.to_string()
}

/// `isModelSupported` per spec.md §4.7: true iff the model carries the
/// `claude-` or `gemini-` prefix.
pub fn is_model_supported(model: &str) -> bool {
    model.starts_with("claude-") || model.starts_with("gemini-")
}

/// The platform's default fallback model, used by the model-not-found retry.
pub fn default_model() -> &'static str {
    DEFAULT_MODEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountStatus, AccountType, Cooldowns, Credentials, Platform};
    use std::collections::HashMap;

    fn account_with_mapping(mapping: Option<serde_json::Map<String, Value>>) -> Account {
        let mut creds = HashMap::new();
        if let Some(m) = mapping {
            creds.insert("model_mapping".to_string(), Value::Object(m));
        }
        Account {
            id: 1,
            name: "a".into(),
            display_name: "a".into(),
            platform: Platform::Antigravity,
            account_type: AccountType::Oauth,
            credentials: Credentials(creds),
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
    fn scenario_4_sonnet_date_stamp_maps_to_sonnet_4_5() {
        let acc = account_with_mapping(None);
        assert_eq!(map_model(&acc, "claude-3-5-sonnet-20241022"), "claude-sonnet-4-5");
    }

    #[test]
    fn account_mapping_takes_precedence() {
        let mut m = serde_json::Map::new();
        m.insert("claude-3-5-sonnet-20241022".to_string(), Value::String("claude-opus-4".to_string()));
        let acc = account_with_mapping(Some(m));
        assert_eq!(map_model(&acc, "claude-3-5-sonnet-20241022"), "claude-opus-4");
    }

    #[test]
    fn gemini_passthrough_without_prefix_match() {
        let acc = account_with_mapping(None);
        assert_eq!(map_model(&acc, "gemini-3-pro"), "gemini-3-pro");
    }

    #[test]
    fn unsupported_model_falls_back_to_default() {
        let acc = account_with_mapping(None);
        assert_eq!(map_model(&acc, "gpt-4"), "claude-sonnet-4-5");
    }

    #[test]
    fn unwrap_extracts_response_key() {
        let body = json!({ "response": { "candidates": [] } });
        assert_eq!(unwrap_response(&body), json!({ "candidates": [] }));
    }
}
