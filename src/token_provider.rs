//! C6 — token provider: cached OAuth access tokens with single-flight
//! refresh per account, per spec.md §4.4.
//!
//! The teacher has no OAuth refresh code at all (its upstreams use static
//! API keys); the single-flight-lock idiom is grounded on
//! `forward::limits`'s `Arc<Mutex<...>>` state pattern, generalized from a
//! process-wide limiter to a per-owner-key lock table. The refresh RPCs
//! themselves are built against `reqwest` the way `forward::client` builds
//! every other upstream call.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::gateway_error::GatewayError;
use crate::model::{Account, Platform};

#[derive(Debug, Clone)]
struct CacheEntry {
    access_token: String,
    expires_at_epoch: i64,
}

struct TokenState {
    cache: HashMap<String, CacheEntry>,
    refresh_locks: HashMap<String, Arc<Mutex<()>>>,
}

static STATE: Lazy<Mutex<TokenState>> =
    Lazy::new(|| Mutex::new(TokenState { cache: HashMap::new(), refresh_locks: HashMap::new() }));

const REFRESH_SKEW_SECS: i64 = 3 * 60;
const CACHE_TTL_FLOOR_SECS: i64 = 60;
const CACHE_TTL_SKEW_SECS: i64 = 5 * 60;
const SINGLE_FLIGHT_TIMEOUT: Duration = Duration::from_secs(30);

async fn lock_for(owner_key: &str) -> Arc<Mutex<()>> {
    let mut state = STATE.lock().await;
    state.refresh_locks.entry(owner_key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

async fn cache_get(owner_key: &str) -> Option<CacheEntry> {
    STATE.lock().await.cache.get(owner_key).cloned()
}

async fn cache_put(owner_key: &str, token: String, ttl_secs: i64) {
    let now = crate::clock::now_epoch_secs();
    STATE
        .lock()
        .await
        .cache
        .insert(owner_key.to_string(), CacheEntry { access_token: token, expires_at_epoch: now + ttl_secs });
}

struct RefreshedToken {
    access_token: String,
    /// absolute epoch seconds; `None` means "no expiry reported".
    expires_at: Option<i64>,
    extra_fields: serde_json::Map<String, serde_json::Value>,
}

/// Platform-specific refresh RPC. Each arm issues the OAuth refresh-token
/// grant against the provider's token endpoint (spec.md §6 "Outbound":
/// Anthropic/OpenAI/Google OAuth token endpoints, Antigravity's own).
async fn refresh_rpc(account: &Account) -> Result<RefreshedToken, GatewayError> {
    let refresh_token = account
        .credentials
        .get_str("refresh_token")
        .ok_or_else(|| GatewayError::TokenRefresh { recoverable: false, message: "missing refresh_token".into() })?;

    let token_endpoint = match account.platform {
        Platform::Anthropic => "https://console.anthropic.com/v1/oauth/token",
        Platform::Openai => "https://auth.openai.com/oauth/token",
        Platform::Gemini | Platform::Antigravity => "https://oauth2.googleapis.com/token",
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(token_endpoint)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }))
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| GatewayError::TokenRefresh { recoverable: true, message: e.to_string() })?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        return Err(GatewayError::TokenRefresh {
            recoverable: status != 400 && status != 401,
            message: format!("refresh endpoint returned {status}"),
        });
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| GatewayError::TokenRefresh { recoverable: true, message: e.to_string() })?;

    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::TokenRefresh { recoverable: true, message: "no access_token in response".into() })?
        .to_string();

    let expires_at = body
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .map(|secs| crate::clock::now_epoch_secs() + secs)
        .or_else(|| body.get("expires_at").and_then(|v| v.as_i64()));

    let mut extra_fields = serde_json::Map::new();
    extra_fields.insert("access_token".to_string(), serde_json::Value::String(access_token.clone()));
    if let Some(rt) = body.get("refresh_token").and_then(|v| v.as_str()) {
        extra_fields.insert("refresh_token".to_string(), serde_json::Value::String(rt.to_string()));
    }
    if let Some(exp) = expires_at {
        extra_fields.insert("expires_at".to_string(), serde_json::Value::Number(exp.into()));
    }

    Ok(RefreshedToken { access_token, expires_at, extra_fields })
}

/// `get_access_token(account) -> token`, per spec.md §4.4's 5-step algorithm.
pub async fn get_access_token(account: &Account) -> Result<String, GatewayError> {
    let owner_key = account.token_owner_key();

    if let Some(entry) = cache_get(&owner_key).await {
        if entry.expires_at_epoch > crate::clock::now_epoch_secs() {
            return Ok(entry.access_token);
        }
    }

    let needs_refresh = match account.credentials.get_epoch_secs("expires_at") {
        None => true,
        Some(expires_at) => expires_at - crate::clock::now_epoch_secs() <= REFRESH_SKEW_SECS,
    };

    if !needs_refresh {
        if let Some(token) = account.credentials.get_str("access_token") {
            return Ok(token);
        }
    }

    let lock = lock_for(&owner_key).await;
    let _guard = timeout(SINGLE_FLIGHT_TIMEOUT, lock.lock()).await.map_err(|_| {
        crate::logger::warn("token_provider", &format!("single-flight timeout for {owner_key}, returning stale token"));
        GatewayError::TokenRefresh { recoverable: true, message: "refresh lock timeout".into() }
    });
    let _guard = match _guard {
        Ok(g) => g,
        Err(e) => {
            if let Some(entry) = cache_get(&owner_key).await {
                return Ok(entry.access_token);
            }
            return Err(e);
        }
    };

    // Re-check cache under the lock: another task may have refreshed first.
    if let Some(entry) = cache_get(&owner_key).await {
        if entry.expires_at_epoch > crate::clock::now_epoch_secs() {
            return Ok(entry.access_token);
        }
    }

    let refreshed = refresh_rpc(account).await?;
    crate::accounts::merge_credentials(account.id, &refreshed.extra_fields);

    let ttl = match refreshed.expires_at {
        Some(exp) => (exp - crate::clock::now_epoch_secs() - CACHE_TTL_SKEW_SECS).max(CACHE_TTL_FLOOR_SECS),
        None => CACHE_TTL_FLOOR_SECS,
    };
    cache_put(&owner_key, refreshed.access_token.clone(), ttl).await;

    Ok(refreshed.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_ttl_floors_at_one_minute() {
        let owner = "account:ttl-test";
        cache_put(owner, "tok".to_string(), 30).await;
        let entry = cache_get(owner).await.unwrap();
        assert!(entry.expires_at_epoch > crate::clock::now_epoch_secs());
    }
}
