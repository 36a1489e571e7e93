//! C7 — account scheduler: `select(ctx, group_id?, session_fingerprint?,
//! model, excluded_ids, platform) -> account`, per spec.md §4.5.
//!
//! Grounded on `forward::middleware::order_routes_for_attempts` (priority
//! groups, descending, shuffled within a group) and `forward::routing`'s
//! candidate-filter/sort/primary+fallback shape, both generalized here from
//! "pick a model route" to "pick an account".

use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::model::{session_key, Account, Platform};

#[derive(Debug, Clone)]
pub struct SelectRequest<'a> {
    pub group_id: Option<i64>,
    pub session_fingerprint: Option<&'a str>,
    pub model: &'a str,
    pub excluded_ids: &'a HashSet<i64>,
    pub platform: Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    NoAvailableAccounts,
}

fn candidate_set(req: &SelectRequest) -> Vec<Account> {
    let mut candidates = match req.group_id {
        Some(gid) if gid != 0 => crate::accounts::list_by_group(gid, req.platform),
        _ => crate::accounts::list_by_platform(req.platform),
    };

    if matches!(req.platform, Platform::Anthropic | Platform::Gemini) {
        let mixed: Vec<Account> = crate::accounts::list_by_platform(Platform::Antigravity)
            .into_iter()
            .filter(|a| a.mixed_scheduling())
            .collect();
        candidates.extend(mixed);
    }

    candidates
}

fn passes_filters(acc: &Account, req: &SelectRequest, now: i64) -> bool {
    if req.excluded_ids.contains(&acc.id) {
        return false;
    }
    if !acc.is_eligible(now) {
        return false;
    }
    if !acc.is_model_supported(req.model) {
        return false;
    }
    true
}

/// Stable sort per spec.md §4.5 ordering: priority asc, then OAuth before
/// API-key, then older `last_used_at` first (nil = infinitely old), then id
/// asc as the final tie-break.
fn order_candidates(mut candidates: Vec<Account>) -> Vec<Account> {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| {
                let a_oauth = a.account_type == crate::model::AccountType::Oauth;
                let b_oauth = b.account_type == crate::model::AccountType::Oauth;
                b_oauth.cmp(&a_oauth) // true (oauth) sorts first
            })
            .then_with(|| {
                let a_age = a.last_used_at.unwrap_or(i64::MIN);
                let b_age = b.last_used_at.unwrap_or(i64::MIN);
                a_age.cmp(&b_age)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// Shuffles within equal-priority groups only, the way
/// `order_routes_for_attempts` shuffles within a priority group before
/// picking one — kept as a hook for callers who want load spreading across
/// equally-ranked accounts; `select` itself uses the strict order above
/// since spec.md §4.5 names a deterministic ordering with no randomness.
#[allow(dead_code)]
pub fn shuffle_within_priority_groups(mut candidates: Vec<Account>) -> Vec<Account> {
    candidates.sort_by_key(|a| a.priority);
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(candidates.len());
    let mut i = 0;
    while i < candidates.len() {
        let mut j = i + 1;
        while j < candidates.len() && candidates[j].priority == candidates[i].priority {
            j += 1;
        }
        let mut group: Vec<Account> = candidates[i..j].to_vec();
        group.shuffle(&mut rng);
        out.extend(group);
        i = j;
    }
    out
}

pub fn select(req: &SelectRequest, now: i64) -> Result<Account, SchedulerError> {
    let candidates: Vec<Account> = candidate_set(req)
        .into_iter()
        .filter(|acc| passes_filters(acc, req, now))
        .collect();

    if candidates.is_empty() {
        return Err(SchedulerError::NoAvailableAccounts);
    }

    if let Some(fingerprint) = req.session_fingerprint {
        let key = session_key(fingerprint, req.platform);
        if let Some(binding) = crate::accounts::get_session_binding(&key) {
            if let Some(bound) = candidates.iter().find(|a| a.id == binding.account_id) {
                return Ok(bound.clone());
            }
        }
    }

    let ordered = order_candidates(candidates);
    let winner = ordered.into_iter().next().expect("checked non-empty above");

    if let Some(fingerprint) = req.session_fingerprint {
        let key = session_key(fingerprint, req.platform);
        crate::accounts::set_session_binding(key, winner.id, now);
    }

    Ok(winner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountEntry, Settings};
    use std::collections::HashSet;

    fn entry(id: i64, priority: i64, account_type: &str) -> AccountEntry {
        AccountEntry {
            id,
            name: format!("acc-{id}"),
            display_name: format!("acc-{id}"),
            platform: "anthropic".to_string(),
            account_type: account_type.to_string(),
            status: "active".to_string(),
            schedulable: true,
            concurrency: 1,
            priority,
            ..Default::default()
        }
    }

    fn setup(entries: Vec<AccountEntry>) {
        crate::accounts::reload_from_config(&Settings { accounts: entries, ..Default::default() });
    }

    #[test]
    fn scenario_1_lower_priority_wins_then_failover_after_cooldown() {
        setup(vec![entry(1, 1, "apikey"), entry(2, 2, "apikey")]);
        let excluded = HashSet::new();
        let req = SelectRequest {
            group_id: None,
            session_fingerprint: None,
            model: "claude-3-5-sonnet",
            excluded_ids: &excluded,
            platform: Platform::Anthropic,
        };
        let picked = select(&req, 1000).unwrap();
        assert_eq!(picked.id, 1);

        crate::accounts::set_rate_limit_reset_at(1, 1060);
        let picked2 = select(&req, 1000).unwrap();
        assert_eq!(picked2.id, 2);
    }

    #[test]
    fn oauth_preferred_over_apikey_at_equal_priority() {
        setup(vec![entry(1, 5, "apikey"), entry(2, 5, "oauth")]);
        let excluded = HashSet::new();
        let req = SelectRequest {
            group_id: None,
            session_fingerprint: None,
            model: "m",
            excluded_ids: &excluded,
            platform: Platform::Anthropic,
        };
        let picked = select(&req, 1000).unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn empty_candidate_set_is_scheduling_error() {
        setup(vec![]);
        let excluded = HashSet::new();
        let req = SelectRequest {
            group_id: None,
            session_fingerprint: None,
            model: "m",
            excluded_ids: &excluded,
            platform: Platform::Anthropic,
        };
        assert_eq!(select(&req, 0).unwrap_err(), SchedulerError::NoAvailableAccounts);
    }

    #[test]
    fn sticky_session_survives_iff_still_eligible() {
        setup(vec![entry(1, 1, "apikey"), entry(2, 2, "apikey")]);
        let excluded = HashSet::new();
        let req = SelectRequest {
            group_id: None,
            session_fingerprint: Some("conv-abc"),
            model: "m",
            excluded_ids: &excluded,
            platform: Platform::Anthropic,
        };
        let first = select(&req, 0).unwrap();
        assert_eq!(first.id, 1);
        let second = select(&req, 1).unwrap();
        assert_eq!(second.id, 1, "sticky binding should re-select the same account");

        crate::accounts::set_rate_limit_reset_at(1, 100000);
        let third = select(&req, 0).unwrap();
        assert_eq!(third.id, 2, "binding degrades to normal selection once ineligible");
    }
}
