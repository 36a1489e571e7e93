//! C8 — Gemini quota policy: a per-tier daily/minute quota table consulted
//! by the classifier only to compute the daily reset time shown to users.
//! Scheduling decisions never consult this table directly (spec.md §4.3) —
//! they consult only the cooldown fields C5 sets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `-1` means unlimited/pay-as-you-go, `0` or absent means not applicable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TierQuota {
    pub shared_rpd: i64,
    pub shared_rpm: i64,
    pub pro_rpd: i64,
    pub pro_rpm: i64,
    pub flash_rpd: i64,
    pub flash_rpm: i64,
    /// Cooldown seconds applied when this tier's quota is exhausted.
    pub cooldown: i64,
}

pub const KNOWN_TIERS: &[&str] = &[
    "aistudio_free",
    "aistudio_paid",
    "google_one_free",
    "google_ai_pro",
    "google_ai_ultra",
    "gcp_standard",
    "gcp_enterprise",
];

/// Normalizes legacy upper-case aliases (`AISTUDIO_FREE` -> `aistudio_free`).
pub fn normalize_tier_id(tier_id: &str) -> String {
    tier_id.to_ascii_lowercase()
}

pub fn lookup(table: &HashMap<String, TierQuota>, tier_id: &str) -> Option<TierQuota> {
    table.get(&normalize_tier_id(tier_id)).copied()
}

/// Seconds until the next UTC midnight, used to compute the "daily reset
/// time" displayed to callers whose `shared_rpd`/`pro_rpd`/`flash_rpd` quota
/// is exhausted.
pub fn seconds_until_daily_reset(now: chrono::DateTime<chrono::Utc>) -> i64 {
    let tomorrow = (now + chrono::Duration::days(1)).date_naive();
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap();
    let midnight_utc = chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(midnight, chrono::Utc);
    (midnight_utc - now).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_is_minus_one() {
        let q = TierQuota { shared_rpd: -1, ..Default::default() };
        assert_eq!(q.shared_rpd, -1);
    }

    #[test]
    fn legacy_alias_normalizes() {
        assert_eq!(normalize_tier_id("GOOGLE_AI_PRO"), "google_ai_pro");
    }

    #[test]
    fn daily_reset_is_within_24h() {
        let now = chrono::Utc::now();
        let secs = seconds_until_daily_reset(now);
        assert!(secs >= 0 && secs <= 86400);
    }
}
