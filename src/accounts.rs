//! The account repository: seeded from `config::Settings.accounts` at
//! startup, mutated only by the core (cooldown fields, `last_used_at`,
//! session bindings), read by the scheduler, classifier, and token provider.
//!
//! spec.md §9 notes the source models `Account <-> Proxy <-> Group` as
//! cyclic references resolved via integer ids; this store never materializes
//! back-pointers, it only ever looks accounts up by id.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::{Account, Platform, SessionBinding};

struct Store {
    accounts: HashMap<i64, Account>,
    session_bindings: HashMap<String, SessionBinding>,
}

static STORE: Lazy<RwLock<Store>> = Lazy::new(|| {
    RwLock::new(Store {
        accounts: HashMap::new(),
        session_bindings: HashMap::new(),
    })
});

/// Reloads the account set from configuration. Existing cooldowns are
/// preserved for accounts that still exist (a config save should not erase
/// an in-flight cooldown window), dropped for accounts that are gone.
pub fn reload_from_config(cfg: &crate::config::Settings) {
    let mut next: HashMap<i64, Account> = HashMap::new();
    for entry in &cfg.accounts {
        if let Some(acc) = entry.clone().into_account() {
            next.insert(acc.id, acc);
        }
    }
    let mut store = STORE.write().unwrap();
    for (id, acc) in next.iter_mut() {
        if let Some(existing) = store.accounts.get(id) {
            acc.cooldowns = existing.cooldowns.clone();
            acc.last_used_at = existing.last_used_at;
        }
    }
    store.accounts = next;
}

pub fn list_all() -> Vec<Account> {
    STORE.read().unwrap().accounts.values().cloned().collect()
}

pub fn get(id: i64) -> Option<Account> {
    STORE.read().unwrap().accounts.get(&id).cloned()
}

pub fn list_by_platform(platform: Platform) -> Vec<Account> {
    STORE
        .read()
        .unwrap()
        .accounts
        .values()
        .filter(|a| a.platform == platform)
        .cloned()
        .collect()
}

pub fn list_by_group(group_id: i64, platform: Platform) -> Vec<Account> {
    STORE
        .read()
        .unwrap()
        .accounts
        .values()
        .filter(|a| a.group_id == Some(group_id) && a.platform == platform)
        .cloned()
        .collect()
}

pub fn mark_status(id: i64, status: crate::model::AccountStatus) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        acc.status = status;
    }
}

pub fn set_rate_limit_reset_at(id: i64, t: i64) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        acc.cooldowns.set_rate_limit_reset_at(t);
    }
}

pub fn set_overload_until(id: i64, t: i64, repeat: i64) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        acc.cooldowns.set_overload_until(t);
        acc.cooldowns.set_overload_repeat(repeat);
    }
}

pub fn set_temp_unschedulable(id: i64, t: i64, reason: String) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        acc.cooldowns.set_temp_unschedulable(t, reason);
    }
}

pub fn touch_last_used(id: i64, t: i64) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        acc.last_used_at = Some(t);
    }
}

/// Merges credential fields refreshed by the token provider (spec.md §4.4
/// step 4: "merge the refreshed token fields... preserve non-token keys").
pub fn merge_credentials(id: i64, refreshed: &serde_json::Map<String, serde_json::Value>) {
    if let Some(acc) = STORE.write().unwrap().accounts.get_mut(&id) {
        for (k, v) in refreshed {
            acc.credentials.0.insert(k.clone(), v.clone());
        }
    }
}

pub fn get_session_binding(key: &str) -> Option<SessionBinding> {
    STORE.read().unwrap().session_bindings.get(key).cloned()
}

pub fn set_session_binding(key: String, account_id: i64, now: i64) {
    STORE
        .write()
        .unwrap()
        .session_bindings
        .insert(key, SessionBinding { account_id, bound_at: now });
}

/// Background sweep for expired session bindings, mirrors the TTL-pruning
/// pattern C4 uses for slot sets.
pub fn prune_expired_sessions(now: i64) {
    let mut store = STORE.write().unwrap();
    store
        .session_bindings
        .retain(|_, b| now - b.bound_at < crate::model::SESSION_BINDING_TTL_SECS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountEntry, Settings};

    fn entry(id: i64, platform: &str) -> AccountEntry {
        AccountEntry {
            id,
            name: format!("acc-{id}"),
            display_name: format!("acc-{id}"),
            platform: platform.to_string(),
            account_type: "apikey".to_string(),
            status: "active".to_string(),
            schedulable: true,
            concurrency: 1,
            priority: 0,
            ..Default::default()
        }
    }

    #[test]
    fn reload_preserves_cooldowns_for_surviving_accounts() {
        reload_from_config(&Settings { accounts: vec![entry(1, "anthropic")], ..Default::default() });
        set_rate_limit_reset_at(1, 99999);
        reload_from_config(&Settings { accounts: vec![entry(1, "anthropic")], ..Default::default() });
        let acc = get(1).unwrap();
        assert_eq!(acc.cooldowns.rate_limit_reset_at, 99999);
    }

    #[test]
    fn reload_drops_removed_accounts() {
        reload_from_config(&Settings {
            accounts: vec![entry(1, "anthropic"), entry(2, "anthropic")],
            ..Default::default()
        });
        reload_from_config(&Settings { accounts: vec![entry(1, "anthropic")], ..Default::default() });
        assert!(get(2).is_none());
    }
}
