//! C2 — pricing catalog: per-token cost lookup with family-based fallback
//! and remote refresh, per spec.md §4.1.
//!
//! The teacher's `pricing.rs` was an 18-line `cost_usd(prompt, completion,
//! price_prompt_per_1k, price_completion_per_1k)` helper; that arithmetic
//! survives as `per_1k_to_per_token` below, with the catalog, candidate
//! lookup chain and refresh protocol spec.md describes built around it.
//! Uses `reqwest` for the remote fetch, `sha2`/`hex` for the hash-check
//! ticker, and `once_cell::sync::Lazy` for the process-wide, lock-free-read
//! catalog (spec.md §9 "Global state").

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::model::PricingEntry;

/// `price_per_1k / 1000`, the arithmetic the teacher's `cost_usd` performed.
pub fn per_1k_to_per_token(price_per_1k: f64) -> f64 {
    price_per_1k / 1000.0
}

#[derive(Default)]
struct Catalog {
    entries: HashMap<String, PricingEntry>,
    last_updated: Option<i64>,
    local_hash: Option<String>,
}

static CATALOG: Lazy<RwLock<Catalog>> =
    Lazy::new(|| RwLock::new(Catalog { entries: bundled_family_defaults(), ..Default::default() }));

/// Hard-coded family prices, the last-resort fallback tier spec.md §4.1
/// requires when no local file and no remote fetch succeed.
fn bundled_family_defaults() -> HashMap<String, PricingEntry> {
    let mut m = HashMap::new();
    let mut put = |name: &str, input: f64, output: f64| {
        m.insert(
            name.to_string(),
            PricingEntry {
                input_per_token: per_1k_to_per_token(input),
                output_per_token: per_1k_to_per_token(output),
                cache_creation_per_token: per_1k_to_per_token(input * 1.25),
                cache_read_per_token: per_1k_to_per_token(input * 0.1),
                supports_prompt_caching: true,
                cache_creation_5m_per_token: None,
                cache_creation_1h_per_token: None,
            },
        );
    };
    put("opus-4.5", 5.0, 25.0);
    put("opus-4", 15.0, 75.0);
    put("sonnet-4.5", 3.0, 15.0);
    put("sonnet-4", 3.0, 15.0);
    put("sonnet-3.5", 3.0, 15.0);
    put("sonnet-3", 3.0, 15.0);
    put("haiku-4.5", 1.0, 5.0);
    put("haiku-3.5", 0.8, 4.0);
    put("haiku-3", 0.25, 1.25);
    put("gpt-4", 2.5, 10.0);
    m
}

fn data_dir() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    std::fs::create_dir_all(&p).ok();
    p
}

fn local_pricing_path() -> PathBuf {
    let mut p = data_dir();
    p.push("model_pricing.json");
    p
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn parse_remote_catalog(json: &str) -> HashMap<String, PricingEntry> {
    let mut out = HashMap::new();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        return out;
    };
    let Some(obj) = value.as_object() else {
        return out;
    };
    for (model, entry) in obj {
        if model == "sample_spec" {
            continue;
        }
        let Some(e) = entry.as_object() else { continue };
        let input = e.get("input_cost_per_token").and_then(|v| v.as_f64());
        let output = e.get("output_cost_per_token").and_then(|v| v.as_f64());
        if input.is_none() && output.is_none() {
            continue;
        }
        out.insert(
            model.clone(),
            PricingEntry {
                input_per_token: input.unwrap_or(0.0),
                output_per_token: output.unwrap_or(0.0),
                cache_creation_per_token: e
                    .get("cache_creation_input_token_cost")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                cache_read_per_token: e.get("cache_read_input_token_cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                supports_prompt_caching: e
                    .get("supports_prompt_caching")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                cache_creation_5m_per_token: e
                    .get("cache_creation_input_token_cost_above_1hr")
                    .and_then(|v| v.as_f64()),
                cache_creation_1h_per_token: e.get("cache_creation_input_token_cost_1hr").and_then(|v| v.as_f64()),
            },
        );
    }
    out
}

/// Loads `<data_dir>/model_pricing.json` on start if present; otherwise
/// leaves the bundled family defaults in place until the caller triggers
/// `force_refresh`. Never panics: a missing/corrupt file just means "stay on
/// whatever's already loaded" (spec.md §4.1: "all network failures are
/// non-fatal").
pub fn load_local() {
    let path = local_pricing_path();
    let Ok(content) = std::fs::read_to_string(&path) else { return };
    let entries = parse_remote_catalog(&content);
    if entries.is_empty() {
        return;
    }
    let hash = sha256_hex(content.as_bytes());
    let mut catalog = CATALOG.write().unwrap();
    catalog.entries.extend(entries);
    catalog.local_hash = Some(hash);
    catalog.last_updated = Some(crate::clock::now_epoch_secs());
}

/// Downloads and persists the remote catalog. Non-fatal on any failure —
/// falls back to whatever is already loaded (last good file, then bundled
/// defaults), per spec.md §4.1.
pub async fn force_refresh(remote_url: &str) {
    let client = reqwest::Client::new();
    let resp = match client.get(remote_url).timeout(Duration::from_secs(10)).send().await {
        Ok(r) => r,
        Err(e) => {
            crate::logger::warn("pricing", &format!("remote pricing fetch failed: {e}"));
            return;
        }
    };
    let Ok(body) = resp.text().await else {
        crate::logger::warn("pricing", "remote pricing fetch returned no body");
        return;
    };
    let entries = parse_remote_catalog(&body);
    if entries.is_empty() {
        crate::logger::warn("pricing", "remote pricing fetch parsed to zero usable entries");
        return;
    }
    let hash = sha256_hex(body.as_bytes());
    if std::fs::write(local_pricing_path(), &body).is_err() {
        crate::logger::warn("pricing", "failed to persist downloaded pricing file");
    }
    let mut catalog = CATALOG.write().unwrap();
    catalog.entries.extend(entries);
    catalog.local_hash = Some(hash);
    catalog.last_updated = Some(crate::clock::now_epoch_secs());
}

/// Fetches just the remote hash text and compares against the local hash;
/// re-downloads only on mismatch. Intended to run on a ticker
/// (`hash_check_interval_minutes`, floored at 1 minute).
pub async fn check_remote_hash(remote_url: &str, hash_url: &str) {
    let client = reqwest::Client::new();
    let Ok(resp) = client.get(hash_url).timeout(Duration::from_secs(5)).send().await else {
        return;
    };
    let Ok(remote_hash) = resp.text().await else { return };
    let remote_hash = remote_hash.trim().to_string();
    let local_hash = CATALOG.read().unwrap().local_hash.clone();
    if local_hash.as_deref() != Some(remote_hash.as_str()) {
        force_refresh(remote_url).await;
    }
}

pub fn spawn_refresh_ticker(remote_url: String, hash_url: String, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1) * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            check_remote_hash(&remote_url, &hash_url).await;
        }
    });
}

fn strip_models_prefix(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

fn last_path_segment(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

/// Replaces the first `-N-M-` with `-N.M-` (e.g. `gpt-5-2-codex` ->
/// `gpt-5.2-codex`), matching spec.md §3's lookup-candidate chain.
fn dash_decimal_variant(model: &str) -> Option<String> {
    static RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"-(\d+)-(\d+)-").unwrap());
    RE.captures(model).map(|c| RE.replace(model, format!("-{}.{}-", &c[1], &c[2])).to_string())
}

/// Strips an 8-digit date stamp or a colon-separated version suffix.
fn strip_date_or_version_suffix(model: &str) -> Option<String> {
    static DATE_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"-(\d{8})$").unwrap());
    static COLON_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r":[^:]+$").unwrap());
    if let Some(m) = DATE_RE.find(model) {
        return Some(model[..m.start()].to_string());
    }
    if COLON_RE.is_match(model) {
        return Some(COLON_RE.replace(model, "").to_string());
    }
    None
}

fn family_fuzzy_match(model: &str) -> Option<&'static str> {
    let lower = model.to_ascii_lowercase();
    let family = if lower.contains("opus") {
        "opus"
    } else if lower.contains("sonnet") {
        "sonnet"
    } else if lower.contains("haiku") {
        "haiku"
    } else {
        return None;
    };
    for version in ["4.5", "4", "3.5", "3"] {
        if lower.contains(version) {
            return Some(match (family, version) {
                ("opus", "4.5") => "opus-4.5",
                ("opus", _) => "opus-4",
                ("sonnet", "4.5") => "sonnet-4.5",
                ("sonnet", "4") => "sonnet-4",
                ("sonnet", "3.5") => "sonnet-3.5",
                ("sonnet", _) => "sonnet-3",
                ("haiku", "4.5") => "haiku-4.5",
                ("haiku", "3.5") => "haiku-3.5",
                ("haiku", _) => "haiku-3",
                _ => unreachable!(),
            });
        }
    }
    match family {
        "opus" => Some("opus-4"),
        "sonnet" => Some("sonnet-4.5"),
        "haiku" => Some("haiku-3.5"),
        _ => None,
    }
}

/// Truncates a `gpt-N(.M)?` model id to its bare `gpt-N` / `gpt-N.M` prefix,
/// dropping everything after it (`-codex`, a date stamp, etc), per spec.md
/// §4.1's "strip trailing suffix after the first `gpt-N(.M)?` capture".
fn gpt_n_m_prefix(model: &str) -> Option<String> {
    static RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"^(gpt-\d+(?:\.\d+)?)").unwrap());
    RE.captures(model).map(|c| c[1].to_string())
}

/// Falls back to a single default model for `gpt-*` models specifically
/// (spec.md §4.1's "else last-resort default model").
fn gpt_family_fallback(model: &str) -> Option<&'static str> {
    if !model.starts_with("gpt-") {
        return None;
    }
    Some("gpt-4")
}

/// Builds the ordered candidate list described in spec.md §3/§4.1 and
/// returns the first hit, falling back to the default family (Sonnet) on a
/// total miss.
pub fn lookup(model: &str) -> Option<PricingEntry> {
    let catalog = CATALOG.read().unwrap();

    let mut candidates: Vec<String> =
        vec![model.to_string(), strip_models_prefix(model).to_string(), last_path_segment(model).to_string()];
    if let Some(v) = dash_decimal_variant(model) {
        candidates.push(v);
    }
    for c in candidates.iter() {
        if let Some(e) = catalog.entries.get(c) {
            return Some(*e);
        }
    }

    // Strip date stamps / version suffixes and retry.
    let mut stripped_candidates = Vec::new();
    for c in &candidates {
        if let Some(s) = strip_date_or_version_suffix(c) {
            stripped_candidates.push(s);
        }
    }
    for c in &stripped_candidates {
        if let Some(e) = catalog.entries.get(c) {
            return Some(*e);
        }
    }

    if let Some(family) = family_fuzzy_match(model) {
        if let Some(e) = catalog.entries.get(family) {
            return Some(*e);
        }
    }

    if let Some(prefix) = gpt_n_m_prefix(model) {
        if let Some(e) = catalog.entries.get(&prefix) {
            return Some(*e);
        }
    }

    if let Some(fallback) = gpt_family_fallback(model) {
        if let Some(e) = catalog.entries.get(fallback) {
            return Some(*e);
        }
    }

    catalog.entries.get("sonnet-4.5").copied()
}

pub struct CatalogStatus {
    pub model_count: usize,
    pub last_updated: Option<i64>,
    pub local_hash_prefix: Option<String>,
}

pub fn status() -> CatalogStatus {
    let catalog = CATALOG.read().unwrap();
    CatalogStatus {
        model_count: catalog.entries.len(),
        last_updated: catalog.last_updated,
        local_hash_prefix: catalog.local_hash.as_ref().map(|h| h[..h.len().min(12)].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_hits_directly() {
        let entry = lookup("sonnet-4.5").unwrap();
        assert!(entry.input_per_token > 0.0);
    }

    #[test]
    fn scenario_6_gpt_date_stamp_falls_back_to_base_model() {
        {
            let mut catalog = CATALOG.write().unwrap();
            catalog.entries.insert(
                "gpt-5.2".to_string(),
                PricingEntry { input_per_token: 0.000002, output_per_token: 0.000008, ..Default::default() },
            );
        }
        let entry = lookup("gpt-5.2-codex-20251222").unwrap();
        assert_eq!(entry.input_per_token, 0.000002);
    }

    #[test]
    fn fuzzy_family_match_falls_back_when_exact_miss() {
        let entry = lookup("claude-3-5-sonnet-20241022-some-unknown-suffix").unwrap();
        assert!(entry.input_per_token > 0.0);
    }

    #[test]
    fn total_miss_returns_default_sonnet_family() {
        let entry = lookup("totally-unknown-model-xyz").unwrap();
        let sonnet = CATALOG.read().unwrap().entries.get("sonnet-4.5").copied().unwrap();
        assert_eq!(entry.input_per_token, sonnet.input_per_token);
    }

    #[test]
    fn dash_decimal_variant_rewrite() {
        assert_eq!(dash_decimal_variant("gpt-5-2-codex"), Some("gpt-5.2-codex".to_string()));
        assert_eq!(dash_decimal_variant("gpt-5"), None);
    }
}
