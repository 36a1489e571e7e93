//! The user repository. Real authentication (password/JWT/session/SSO) is
//! explicitly out of scope; this store only resolves an already-extracted
//! bearer token to a `model::User` so the orchestrator has something to
//! acquire a concurrency slot and a billing multiplier against, per
//! spec.md §4.8 step 1 ("authenticate the caller (external)").
//!
//! Grounded on `accounts.rs`'s `reload_from_config`/lookup-by-key shape.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::User;

struct Store {
    users: HashMap<i64, User>,
    by_api_key: HashMap<String, i64>,
}

static STORE: Lazy<RwLock<Store>> = Lazy::new(|| {
    RwLock::new(Store {
        users: HashMap::new(),
        by_api_key: HashMap::new(),
    })
});

pub fn reload_from_config(cfg: &crate::config::Settings) {
    let mut users = HashMap::new();
    let mut by_api_key = HashMap::new();
    for entry in &cfg.users {
        let api_key = entry.api_key.clone();
        let user = entry.clone().into_user();
        if !api_key.is_empty() {
            by_api_key.insert(api_key, user.id);
        }
        users.insert(user.id, user);
    }
    let mut store = STORE.write().unwrap();
    store.users = users;
    store.by_api_key = by_api_key;
}

pub fn get(id: i64) -> Option<User> {
    STORE.read().unwrap().users.get(&id).cloned()
}

/// Resolves a bearer token to a user. Returns `None` on no match; the
/// server layer maps that to `GatewayError::Auth`.
pub fn authenticate(bearer_token: &str) -> Option<User> {
    let store = STORE.read().unwrap();
    let id = store.by_api_key.get(bearer_token)?;
    store.users.get(id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, UserEntry};

    fn entry(id: i64, api_key: &str) -> UserEntry {
        UserEntry {
            id,
            email: format!("user-{id}@example.com"),
            api_key: api_key.to_string(),
            role: "user".to_string(),
            balance_usd: 10.0,
            concurrency: 2,
            status: "active".to_string(),
            token_version: 1,
            rate_multiplier: 1.0,
            allowed_groups: vec![],
        }
    }

    #[test]
    fn authenticate_matches_api_key() {
        reload_from_config(&Settings { users: vec![entry(1, "sk-abc")], ..Default::default() });
        let user = authenticate("sk-abc").unwrap();
        assert_eq!(user.id, 1);
        assert!(authenticate("sk-wrong").is_none());
    }
}
