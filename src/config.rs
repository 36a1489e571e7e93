//! TOML-backed settings, loaded the way the teacher loads its `Settings`:
//! read-or-default, then auto-repair missing-but-required fields and persist
//! the repaired copy. `Upstream`/`ModelCfg` are replaced by the account pool,
//! pricing-refresh policy and the `RateLimitConfig` spec.md §4.2/§4.8 needs —
//! the teacher's `forward/limits.rs` already reads `cfg.limits` as if this
//! type existed; it is defined here properly.

use dirs::data_dir;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf};

use crate::model::{Account, AccountStatus, AccountType, Cooldowns, Credentials, Platform, User, UserRole};

#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub accounts: Vec<AccountEntry>,
    /// User authentication/authorization itself is out of scope; these
    /// entries exist only so the gateway has *something* to resolve a
    /// bearer token to a `model::User` with, per spec.md §4.8 step 1.
    pub users: Vec<UserEntry>,
    pub retry_max_attempts: Option<u32>,
    pub retry_initial_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    /// Forward token used to protect the proxy endpoints.
    pub forward_token: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub limits: RateLimitConfig,
    pub pricing: PricingRefreshConfig,
    pub quota: HashMap<String, crate::quota::TierQuota>,
    /// spec.md §4.7 "Model-not-found fallback".
    pub enable_model_fallback: Option<bool>,
}

/// One account as persisted in TOML; converted to `model::Account` at load
/// time. Cooldowns and `last_used_at` are *not* part of the persisted file —
/// they are runtime state owned by `crate::accounts::AccountStore` and are
/// reset to "clear" on every process start, matching spec.md §3's framing
/// that accounts are CRUD-managed externally while cooldowns are mutated
/// only by the core at runtime.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccountEntry {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub platform: String,
    pub account_type: String,
    pub credentials: HashMap<String, serde_json::Value>,
    pub extra: HashMap<String, serde_json::Value>,
    pub proxy_id: Option<i64>,
    pub group_id: Option<i64>,
    pub concurrency: i64,
    pub priority: i64,
    pub status: String,
    pub schedulable: bool,
}

impl AccountEntry {
    pub fn into_account(self) -> Option<Account> {
        Some(Account {
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            platform: Platform::from_str(&self.platform)?,
            account_type: match self.account_type.as_str() {
                "oauth" => AccountType::Oauth,
                "setup-token" => AccountType::SetupToken,
                _ => AccountType::Apikey,
            },
            credentials: Credentials(self.credentials),
            extra: self.extra,
            proxy_id: self.proxy_id,
            group_id: self.group_id,
            concurrency: self.concurrency,
            priority: self.priority,
            status: match self.status.as_str() {
                "disabled" => AccountStatus::Disabled,
                "error" => AccountStatus::Error,
                _ => AccountStatus::Active,
            },
            schedulable: self.schedulable,
            cooldowns: Cooldowns::default(),
            last_used_at: None,
        })
    }
}

/// One user as persisted in TOML; converted to `model::User` at load time.
/// `api_key` stands in for the out-of-scope JWT/session mechanism — a bearer
/// token is compared against this field directly.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UserEntry {
    pub id: i64,
    pub email: String,
    pub api_key: String,
    pub role: String,
    pub balance_usd: f64,
    pub concurrency: i64,
    pub status: String,
    pub token_version: i64,
    pub rate_multiplier: f64,
    pub allowed_groups: Vec<i64>,
}

impl UserEntry {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            role: if self.role == "admin" { UserRole::Admin } else { UserRole::User },
            balance_usd: self.balance_usd,
            concurrency: self.concurrency,
            status: match self.status.as_str() {
                "disabled" => AccountStatus::Disabled,
                "error" => AccountStatus::Error,
                _ => AccountStatus::Active,
            },
            token_version: self.token_version,
            rate_multiplier: if self.rate_multiplier > 0.0 { self.rate_multiplier } else { 1.0 },
            allowed_groups: self.allowed_groups,
        }
    }
}

/// Concurrency/RPM/budget policy. Consumed by `crate::concurrency`.
#[derive(Serialize, Deserialize, Clone, Default, Debug)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rpm: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_concurrent_per_session: Option<u32>,
    pub budget_daily_usd: Option<f64>,
    pub budget_weekly_usd: Option<f64>,
    pub budget_monthly_usd: Option<f64>,
}

/// spec.md §4.1 refresh protocol knobs.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PricingRefreshConfig {
    pub remote_url: Option<String>,
    pub hash_url: Option<String>,
    pub update_interval_hours: u64,
    pub hash_check_interval_minutes: u64,
}

impl Default for PricingRefreshConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            hash_url: None,
            update_interval_hours: 24,
            hash_check_interval_minutes: 60,
        }
    }
}

/// Proxy configuration, unchanged in shape from the teacher.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bypass: Option<Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_type: "system".to_string(),
            url: None,
            username: None,
            password: None,
            bypass: None,
        }
    }
}

fn gen_forward_token() -> String {
    use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
    let token: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(42)
        .map(char::from)
        .collect();
    format!("gw_{token}")
}

fn settings_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

pub fn load() -> Settings {
    let p = settings_path();
    let mut cfg = if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            crate::logger::warn("config", &format!("failed to parse settings.toml: {e}"));
            Settings::default()
        })
    } else {
        Settings::default()
    };

    let mut changed = false;
    if cfg.forward_token.as_deref().map(|t| t.is_empty()).unwrap_or(true) {
        cfg.forward_token = Some(gen_forward_token());
        changed = true;
    }
    if cfg.retry_max_attempts.is_none() {
        cfg.retry_max_attempts = Some(3);
        changed = true;
    }
    if cfg.retry_initial_ms.is_none() {
        cfg.retry_initial_ms = Some(1000);
        changed = true;
    }
    if cfg.retry_max_ms.is_none() {
        cfg.retry_max_ms = Some(16_000);
        changed = true;
    }

    if changed {
        let _ = save(&cfg);
    }

    cfg
}

pub fn save(cfg: &Settings) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config directory: {e}"))?;
    }
    let s = toml::to_string_pretty(cfg).map_err(|e| format!("failed to serialize config: {e}"))?;
    fs::write(&p, &s).map_err(|e| format!("failed to write config file to {p:?}: {e}"))?;
    Ok(())
}

pub fn reset() -> Result<(), String> {
    let p = settings_path();
    if p.exists() {
        fs::remove_file(&p).map_err(|e| format!("failed to remove config file {p:?}: {e}"))?;
    }
    Ok(())
}

pub fn refresh_forward_token() -> String {
    let mut cfg = load();
    cfg.forward_token = Some(gen_forward_token());
    let _ = save(&cfg);
    cfg.forward_token.clone().unwrap_or_default()
}

#[cfg(target_os = "windows")]
#[allow(dead_code)]
mod platform_security {
    use std::{ffi::c_void, ptr::null_mut};
    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{LocalFree, HLOCAL},
            Security::Cryptography::{
                CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
            },
        },
    };

    unsafe fn vec_from_blob(blob: &CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() || blob.cbData == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec()
        }
    }

    unsafe fn blob_from_slice(slice: &[u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: slice.len() as u32,
            pbData: slice.as_ptr() as *mut u8,
        }
    }

    fn free_blob(blob: &mut CRYPT_INTEGER_BLOB) {
        unsafe {
            if !blob.pbData.is_null() {
                let _ = LocalFree(HLOCAL(blob.pbData as *mut c_void));
                blob.pbData = null_mut();
                blob.cbData = 0;
            }
        }
    }

    pub fn protect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB { cbData: 0, pbData: null_mut() };
            if CryptProtectData(&in_blob, PCWSTR::null(), None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob)
                .is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }

    pub fn unprotect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB { cbData: 0, pbData: null_mut() };
            if CryptUnprotectData(&in_blob, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob).is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }
}

#[cfg(target_os = "windows")]
pub use platform_security::{protect, unprotect};

#[cfg(not(target_os = "windows"))]
pub fn protect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}
#[cfg(not(target_os = "windows"))]
pub fn unprotect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_entry_rejects_unknown_platform() {
        let mut e = AccountEntry::default();
        e.platform = "not-a-platform".into();
        assert!(e.into_account().is_none());
    }

    #[test]
    fn account_entry_converts_known_platform() {
        let mut e = AccountEntry::default();
        e.platform = "anthropic".into();
        e.account_type = "oauth".into();
        let acc = e.into_account().unwrap();
        assert_eq!(acc.platform, Platform::Anthropic);
    }
}
