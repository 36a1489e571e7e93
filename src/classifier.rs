//! C5 — rate-limit classifier: maps an upstream error (status code, headers,
//! body) to a cooldown decision on the account, per spec.md §4.3's decision
//! table. The teacher has no direct equivalent (its `forward::error` only
//! maps errors to an HTTP response, never touches account state) — this is
//! built fresh against the same `regex`/`serde_json` stack the teacher
//! already depends on, in the enum-plus-free-function idiom `forward/error.rs`
//! and `forward/client.rs` use elsewhere.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Account, AccountStatus, Platform};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// OAuth account got 401/403: mark `status = error`, leave cooldowns.
    MarkError,
    RateLimit { reset_in_secs: i64 },
    Overload { cooldown_secs: i64, repeat: i64 },
    TempUnschedulable { duration_minutes: i64, reason: String },
    /// 5xx not otherwise matched: handled by the retry loop, not recorded.
    RetryOnly,
    /// Nothing matched; no cooldown applied.
    NoAction,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub status_code: u16,
    pub body: &'a str,
    pub now: i64,
}

static RETRY_DELAY_SECONDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""retryDelay"\s*:\s*"(\d+)s""#).unwrap());
static RETRY_IN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[Pp]lease retry in (\d+(?:\.\d+)?)s"#).unwrap());

fn looks_gemini_shaped(body: &str) -> bool {
    body.contains("\"error\"") && (body.contains("RESOURCE_EXHAUSTED") || body.contains("\"status\""))
}

/// `60s * 2^repeat`, capped at 1 hour — same doubling shape as
/// `clock::backoff_delay`, scaled from the HTTP retry loop's seconds to an
/// account cooldown's minutes-to-hours range.
fn overload_cooldown_secs(repeat: i64) -> i64 {
    let exp = repeat.clamp(0, 6) as u32;
    (60i64 * (1i64 << exp)).min(3600)
}

fn parsed_retry_delay_secs(body: &str) -> Option<i64> {
    if let Some(c) = RETRY_DELAY_SECONDS_RE.captures(body) {
        return c.get(1)?.as_str().parse::<i64>().ok();
    }
    if let Some(c) = RETRY_IN_RE.captures(body) {
        return c.get(1)?.as_str().parse::<f64>().ok().map(|f| f.ceil() as i64);
    }
    None
}

/// First-match-wins decision table, spec.md §4.3.
pub fn classify(account: &Account, input: ClassifyInput) -> Classification {
    let ClassifyInput { status_code, body, now } = input;

    if matches!(status_code, 401 | 403) && account.account_type == crate::model::AccountType::Oauth {
        return Classification::MarkError;
    }

    if status_code == 429 {
        if let Some(delay) = parsed_retry_delay_secs(body) {
            if looks_gemini_shaped(body) || body.contains("retryDelay") || body.to_lowercase().contains("retry in") {
                return Classification::RateLimit { reset_in_secs: delay };
            }
        }
        if looks_gemini_shaped(body) {
            return Classification::RateLimit { reset_in_secs: 300 };
        }
        return Classification::RateLimit { reset_in_secs: 60 };
    }

    if (status_code == 529 || status_code == 503) && body.to_lowercase().contains("overloaded") {
        // Still inside the previous overload window: this is a repeat hit,
        // grow the cooldown. Otherwise the account actually recovered since
        // its last overload, so the counter resets.
        let repeat = if now < account.cooldowns.overload_until { account.cooldowns.overload_repeat + 1 } else { 0 };
        return Classification::Overload { cooldown_secs: overload_cooldown_secs(repeat), repeat };
    }

    if account.custom_error_codes_enabled() && account.custom_error_codes().contains(&(status_code as i64)) {
        // "Same as 429" per spec.md §4.3's decision table.
        return Classification::RateLimit { reset_in_secs: 60 };
    }

    if account.temp_unschedulable_enabled() {
        for rule in account.temp_unschedulable_rules() {
            if rule.error_code == status_code as i64 && rule.keywords.iter().any(|k| body.contains(k.as_str())) {
                return Classification::TempUnschedulable {
                    duration_minutes: rule.duration_minutes,
                    reason: rule.description,
                };
            }
        }
    }

    if (500..600).contains(&status_code) {
        return Classification::RetryOnly;
    }

    Classification::NoAction
}

/// Applies a classification to the account store with a short background
/// deadline, not the request context (spec.md §4.3: "side-effects... run
/// with a short background deadline").
pub async fn apply(account_id: i64, classification: Classification, now: i64) {
    let deadline = std::time::Duration::from_secs(3);
    let _ = tokio::time::timeout(deadline, async {
        match classification {
            Classification::MarkError => crate::accounts::mark_status(account_id, AccountStatus::Error),
            Classification::RateLimit { reset_in_secs } => {
                crate::accounts::set_rate_limit_reset_at(account_id, now + reset_in_secs)
            }
            Classification::Overload { cooldown_secs, repeat } => {
                crate::accounts::set_overload_until(account_id, now + cooldown_secs, repeat)
            }
            Classification::TempUnschedulable { duration_minutes, reason } => {
                crate::accounts::set_temp_unschedulable(account_id, now + duration_minutes * 60, reason)
            }
            Classification::RetryOnly | Classification::NoAction => {}
        }
    })
    .await;
}

/// spec.md §4.7's `should_failover` bit, surfaced to the caller after retry
/// exhaustion.
pub fn should_failover(status_code: u16) -> bool {
    crate::gateway_error::should_failover(status_code)
}

/// spec.md §4.3 last row: "quota policy is consulted by the classifier only
/// for the daily reset time displayed to users". This never feeds back into
/// `classify` above.
pub fn gemini_daily_reset_hint(quota: &crate::quota::TierQuota, now: chrono::DateTime<chrono::Utc>) -> Option<i64> {
    if quota.shared_rpd == 0 && quota.pro_rpd == 0 && quota.flash_rpd == 0 {
        return None;
    }
    Some(crate::quota::seconds_until_daily_reset(now))
}

#[allow(dead_code)]
fn client_protocol_for(platform: Platform) -> Platform {
    platform
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountType, Cooldowns, Credentials};
    use std::collections::HashMap;

    fn account(account_type: AccountType) -> Account {
        Account {
            id: 1,
            name: "a".into(),
            display_name: "a".into(),
            platform: Platform::Anthropic,
            account_type,
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
    fn oauth_401_marks_error() {
        let acc = account(AccountType::Oauth);
        let c = classify(&acc, ClassifyInput { status_code: 401, body: "", now: 0 });
        assert_eq!(c, Classification::MarkError);
    }

    #[test]
    fn apikey_401_is_no_action() {
        let acc = account(AccountType::Apikey);
        let c = classify(&acc, ClassifyInput { status_code: 401, body: "", now: 0 });
        assert_eq!(c, Classification::NoAction);
    }

    #[test]
    fn gemini_429_with_retry_delay_uses_parsed_value() {
        let acc = account(AccountType::Oauth);
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED","retryDelay":"12s"}}"#;
        let c = classify(&acc, ClassifyInput { status_code: 429, body, now: 0 });
        assert_eq!(c, Classification::RateLimit { reset_in_secs: 12 });
    }

    #[test]
    fn gemini_429_without_delay_falls_back_to_5min() {
        let acc = account(AccountType::Oauth);
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#;
        let c = classify(&acc, ClassifyInput { status_code: 429, body, now: 0 });
        assert_eq!(c, Classification::RateLimit { reset_in_secs: 300 });
    }

    #[test]
    fn plain_429_falls_back_to_1min() {
        let acc = account(AccountType::Apikey);
        let c = classify(&acc, ClassifyInput { status_code: 429, body: "too many requests", now: 0 });
        assert_eq!(c, Classification::RateLimit { reset_in_secs: 60 });
    }

    #[test]
    fn overload_529_first_hit_is_flat_minute() {
        let acc = account(AccountType::Apikey);
        let c = classify(&acc, ClassifyInput { status_code: 529, body: "the service is overloaded", now: 1000 });
        assert_eq!(c, Classification::Overload { cooldown_secs: 60, repeat: 0 });
    }

    #[test]
    fn overload_529_repeat_hit_grows_exponentially() {
        let mut acc = account(AccountType::Apikey);
        // Still inside a previous overload window that ends at 2000.
        acc.cooldowns.overload_until = 2000;
        acc.cooldowns.overload_repeat = 2;
        let c = classify(&acc, ClassifyInput { status_code: 529, body: "the service is overloaded", now: 1500 });
        assert_eq!(c, Classification::Overload { cooldown_secs: 480, repeat: 3 });
    }

    #[test]
    fn overload_529_resets_after_window_elapses() {
        let mut acc = account(AccountType::Apikey);
        acc.cooldowns.overload_until = 1000;
        acc.cooldowns.overload_repeat = 4;
        let c = classify(&acc, ClassifyInput { status_code: 529, body: "the service is overloaded", now: 2000 });
        assert_eq!(c, Classification::Overload { cooldown_secs: 60, repeat: 0 });
    }

    #[test]
    fn plain_5xx_is_retry_only() {
        let acc = account(AccountType::Apikey);
        let c = classify(&acc, ClassifyInput { status_code: 500, body: "boom", now: 0 });
        assert_eq!(c, Classification::RetryOnly);
    }
}
