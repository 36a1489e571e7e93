//! Core data model: accounts, users, session bindings and the dynamically
//! typed credential map described in spec.md §3 / §9 ("dynamic-typed
//! credentials").
//!
//! The teacher's `config.rs` models upstreams as a statically typed TOML
//! struct (`Upstream { id, endpoints, api_style, api_key }`). This gateway's
//! accounts carry heterogeneous per-platform credential fields (OAuth token
//! pairs, tier ids, model mapping tables, temp-unschedulable rules) so the
//! credential bag is represented as a tagged value type with numeric-tolerant
//! accessors, the way spec.md §9 asks for.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::Openai),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Platform::Anthropic => "https://api.anthropic.com",
            Platform::Openai => "https://api.openai.com",
            Platform::Gemini => "https://generativelanguage.googleapis.com",
            Platform::Antigravity => "https://daiservice-pa.googleapis.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Oauth,
    SetupToken,
    Apikey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

/// A dynamically typed credential value. `expires_at` in particular must
/// parse identically whether the source stored it as a JSON string, integer
/// or float (spec.md §3 "numeric-tolerant accessors").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials(pub HashMap<String, Value>);

impl Credentials {
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    /// Accepts string, integer, or float JSON representations identically.
    pub fn get_epoch_secs(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(i)
                } else {
                    n.as_f64().map(|f| f as i64)
                }
            }
            Value::String(s) => {
                if let Ok(i) = s.parse::<i64>() {
                    return Some(i);
                }
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp())
            }
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Bool(true)))
    }

    /// Accepts an array of strings, or an array of any scalar coerced to
    /// string (spec.md §3 "accept array of strings or array of any").
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_object(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        self.0.get(key).and_then(|v| v.as_object())
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.0.get(key).and_then(|v| v.as_array())
    }
}

#[derive(Debug, Clone)]
pub struct TempUnschedulableRule {
    pub error_code: i64,
    pub keywords: Vec<String>,
    pub duration_minutes: i64,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct Cooldowns {
    pub rate_limit_reset_at: i64,
    pub overload_until: i64,
    /// Consecutive overload count while the previous `overload_until` window
    /// is still active; resets to 0 once an overload window actually elapses.
    pub overload_repeat: i64,
    pub temp_unschedulable_until: i64,
    pub temp_unschedulable_reason: Option<String>,
    pub session_window_start: i64,
    pub session_window_end: i64,
    pub session_window_status: Option<String>,
}

impl Cooldowns {
    /// spec.md §3: cooldowns are monotone within one window, never moved
    /// earlier except by explicit admin clear.
    fn bump(field: &mut i64, new_value: i64) {
        if new_value > *field {
            *field = new_value;
        }
    }

    pub fn set_rate_limit_reset_at(&mut self, t: i64) {
        Self::bump(&mut self.rate_limit_reset_at, t);
    }

    pub fn set_overload_until(&mut self, t: i64) {
        Self::bump(&mut self.overload_until, t);
    }

    pub fn set_overload_repeat(&mut self, repeat: i64) {
        self.overload_repeat = repeat;
    }

    pub fn set_temp_unschedulable(&mut self, t: i64, reason: String) {
        Self::bump(&mut self.temp_unschedulable_until, t);
        self.temp_unschedulable_reason = Some(reason);
    }

    pub fn max_cooldown(&self) -> i64 {
        self.rate_limit_reset_at
            .max(self.overload_until)
            .max(self.temp_unschedulable_until)
            .max(0)
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub credentials: Credentials,
    /// Platform-specific flags such as `mixed_scheduling`.
    pub extra: HashMap<String, Value>,
    pub proxy_id: Option<i64>,
    pub group_id: Option<i64>,
    /// 0 means unlimited.
    pub concurrency: i64,
    /// Lower is higher preference.
    pub priority: i64,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub cooldowns: Cooldowns,
    pub last_used_at: Option<i64>,
}

impl Account {
    /// spec.md §3: eligible iff active, schedulable flag set, and every
    /// cooldown has elapsed.
    pub fn is_eligible(&self, now: i64) -> bool {
        self.status == AccountStatus::Active && self.schedulable && now >= self.cooldowns.max_cooldown()
    }

    pub fn mixed_scheduling(&self) -> bool {
        matches!(self.extra.get("mixed_scheduling"), Some(Value::Bool(true)))
    }

    pub fn model_mapping(&self) -> Option<&serde_json::Map<String, Value>> {
        self.credentials.get_object("model_mapping")
    }

    pub fn custom_error_codes_enabled(&self) -> bool {
        self.credentials.get_bool("custom_error_codes_enabled")
    }

    pub fn custom_error_codes(&self) -> Vec<i64> {
        self.credentials
            .get_array("custom_error_codes")
            .map(|items| items.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default()
    }

    pub fn temp_unschedulable_enabled(&self) -> bool {
        self.credentials.get_bool("temp_unschedulable_enabled")
    }

    pub fn temp_unschedulable_rules(&self) -> Vec<TempUnschedulableRule> {
        self.credentials
            .get_array("temp_unschedulable_rules")
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|r| {
                        let obj = r.as_object()?;
                        Some(TempUnschedulableRule {
                            error_code: obj.get("error_code")?.as_i64()?,
                            keywords: obj
                                .get("keywords")?
                                .as_array()?
                                .iter()
                                .filter_map(|k| k.as_str().map(String::from))
                                .collect(),
                            duration_minutes: obj
                                .get("duration_minutes")
                                .and_then(|v| v.as_i64())
                                .unwrap_or(60),
                            description: obj
                                .get("description")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `isModelSupported` per spec.md §4.5: if `model_mapping` present the
    /// model must be a key; antigravity additionally requires a
    /// `claude-`/`gemini-` prefix.
    pub fn is_model_supported(&self, model: &str) -> bool {
        if self.platform == Platform::Antigravity {
            return model.starts_with("claude-") || model.starts_with("gemini-");
        }
        match self.model_mapping() {
            Some(map) => map.contains_key(model),
            None => true,
        }
    }

    /// Owner key for the token cache / single-flight lock: project_id when
    /// present, else `account:<id>` (spec.md §3 Token cache entry).
    pub fn token_owner_key(&self) -> String {
        self.credentials
            .get_str("project_id")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("account:{}", self.id))
    }

    /// Upstream endpoint(s) for this account, per SPEC_FULL.md §11's
    /// multi-endpoint round-robin: an explicit `endpoints` list takes
    /// precedence, then a single `base_url`, then the platform default.
    pub fn endpoints(&self) -> Vec<String> {
        let list = self.credentials.get_string_list("endpoints");
        if !list.is_empty() {
            return list;
        }
        if let Some(base) = self.credentials.get_str("base_url").filter(|s| !s.is_empty()) {
            return vec![base];
        }
        vec![self.platform.default_base_url().to_string()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Admin,
    User,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    pub balance_usd: f64,
    pub concurrency: i64,
    pub status: AccountStatus,
    pub token_version: i64,
    pub rate_multiplier: f64,
    pub allowed_groups: Vec<i64>,
}

/// spec.md §3 Session binding. Gemini-family lookups prefix the caller's
/// fingerprint with `gemini:` so the same conversation can bind to different
/// accounts in different protocol contexts.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub account_id: i64,
    pub bound_at: i64,
}

pub fn session_key(fingerprint: &str, platform: Platform) -> String {
    if platform == Platform::Gemini {
        format!("gemini:{}", fingerprint)
    } else {
        fingerprint.to_string()
    }
}

pub const SESSION_BINDING_TTL_SECS: i64 = 3600;

/// spec.md §3 Token usage / cost breakdown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub cache_creation_per_token: f64,
    pub cache_read_per_token: f64,
    pub supports_prompt_caching: bool,
    /// Optional split pricing for 5-minute / 1-hour cache writes.
    pub cache_creation_5m_per_token: Option<f64>,
    pub cache_creation_1h_per_token: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub actual_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(pairs: &[(&str, Value)]) -> Credentials {
        Credentials(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn expires_at_parses_string_int_and_float_identically() {
        let a = cred(&[("expires_at", Value::String("1735689600".into()))]);
        let b = cred(&[("expires_at", serde_json::json!(1735689600))]);
        let c = cred(&[("expires_at", serde_json::json!(1735689600.0))]);
        assert_eq!(a.get_epoch_secs("expires_at"), Some(1735689600));
        assert_eq!(b.get_epoch_secs("expires_at"), Some(1735689600));
        assert_eq!(c.get_epoch_secs("expires_at"), Some(1735689600));
    }

    #[test]
    fn expires_at_parses_rfc3339() {
        let a = cred(&[(
            "expires_at",
            Value::String("2025-01-01T00:00:00Z".into()),
        )]);
        assert_eq!(a.get_epoch_secs("expires_at"), Some(1735689600));
    }

    #[test]
    fn cooldowns_never_move_earlier() {
        let mut c = Cooldowns::default();
        c.set_rate_limit_reset_at(100);
        c.set_rate_limit_reset_at(50);
        assert_eq!(c.rate_limit_reset_at, 100);
        c.set_rate_limit_reset_at(200);
        assert_eq!(c.rate_limit_reset_at, 200);
    }

    #[test]
    fn account_eligible_iff_active_schedulable_and_past_cooldown() {
        let mut acc = Account {
            id: 1,
            name: "a".into(),
            display_name: "a".into(),
            platform: Platform::Anthropic,
            account_type: AccountType::Oauth,
            credentials: cred(&[]),
            extra: HashMap::new(),
            proxy_id: None,
            group_id: None,
            concurrency: 1,
            priority: 0,
            status: AccountStatus::Active,
            schedulable: true,
            cooldowns: Cooldowns::default(),
            last_used_at: None,
        };
        assert!(acc.is_eligible(1000));
        acc.cooldowns.set_rate_limit_reset_at(2000);
        assert!(!acc.is_eligible(1000));
        assert!(acc.is_eligible(2000));
    }
}
