//! C10 — upstream HTTP client: proxy resolution, retrying POST, and SSE
//! line draining. Adapted near-verbatim from `forward::client`; the proxy
//! resolution (env, Windows registry, custom) is unchanged, retry/backoff is
//! rewired onto `clock::backoff_delay` so the whole gateway shares one
//! formula (spec.md §4.7), and errors are `GatewayError` instead of the
//! teacher's `ForwardError`.

use std::time::{Duration, Instant};

use reqwest::{header::HeaderMap, Client, NoProxy, Proxy, Response};
use serde_json::Value;

use crate::config::{self, ProxyConfig};
use crate::gateway_error::GatewayError;

#[derive(Default)]
struct SystemProxySettings {
    http: Option<String>,
    https: Option<String>,
    bypass: Option<String>,
}

fn normalize_proxy_url(raw: &str, default_scheme: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{default_scheme}://{trimmed}")
    }
}

fn push_no_proxy_entry(entries: &mut Vec<String>, entry: &str) {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.eq_ignore_ascii_case("<local>") {
        entries.push("localhost".to_string());
        entries.push("127.0.0.1".to_string());
        entries.push("::1".to_string());
        return;
    }
    entries.push(trimmed.to_string());
}

fn build_no_proxy(cfg: &ProxyConfig, extra_bypass: Option<&str>) -> Option<NoProxy> {
    let mut entries = Vec::new();
    if let Some(bypass) = cfg.bypass.as_ref() {
        for item in bypass {
            push_no_proxy_entry(&mut entries, item);
        }
    }
    if let Some(extra) = extra_bypass {
        for item in extra.split(&[';', ','][..]) {
            push_no_proxy_entry(&mut entries, item);
        }
    }
    if entries.is_empty() {
        None
    } else {
        NoProxy::from_string(&entries.join(","))
    }
}

fn system_proxy_from_env() -> Option<SystemProxySettings> {
    let http = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")).ok();
    let https = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy")).ok();
    let bypass = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")).ok();
    if http.is_none() && https.is_none() {
        return None;
    }
    Some(SystemProxySettings { http, https, bypass })
}

#[cfg(target_os = "windows")]
fn read_registry_string(path: &str, value: &str) -> Option<String> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::WIN32_ERROR;
    use windows::Win32::System::Registry::{
        RegGetValueW, HKEY_CURRENT_USER, RRF_RT_REG_EXPAND_SZ, RRF_RT_REG_SZ, REG_VALUE_TYPE,
    };

    let path_w: Vec<u16> = OsStr::new(path).encode_wide().chain(Some(0)).collect();
    let value_w: Vec<u16> = OsStr::new(value).encode_wide().chain(Some(0)).collect();
    let mut data_type = REG_VALUE_TYPE(0);
    let mut data_len: u32 = 0;
    let flags = RRF_RT_REG_SZ | RRF_RT_REG_EXPAND_SZ;

    let status = unsafe {
        RegGetValueW(HKEY_CURRENT_USER, PCWSTR(path_w.as_ptr()), PCWSTR(value_w.as_ptr()), flags, Some(&mut data_type), None, Some(&mut data_len))
    };
    if status != WIN32_ERROR(0) || data_len == 0 {
        return None;
    }

    let mut buffer = vec![0u16; (data_len as usize + 1) / 2];
    let status = unsafe {
        RegGetValueW(
            HKEY_CURRENT_USER,
            PCWSTR(path_w.as_ptr()),
            PCWSTR(value_w.as_ptr()),
            flags,
            Some(&mut data_type),
            Some(buffer.as_mut_ptr() as *mut _),
            Some(&mut data_len),
        )
    };
    if status != WIN32_ERROR(0) {
        return None;
    }

    let len = (data_len as usize / 2).saturating_sub(1);
    let value = String::from_utf16_lossy(&buffer[..len]);
    let trimmed = value.trim_end_matches('\0').trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

#[cfg(target_os = "windows")]
fn read_registry_dword(path: &str, value: &str) -> Option<u32> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::WIN32_ERROR;
    use windows::Win32::System::Registry::{RegGetValueW, HKEY_CURRENT_USER, RRF_RT_REG_DWORD, REG_VALUE_TYPE};

    let path_w: Vec<u16> = OsStr::new(path).encode_wide().chain(Some(0)).collect();
    let value_w: Vec<u16> = OsStr::new(value).encode_wide().chain(Some(0)).collect();
    let mut data_type = REG_VALUE_TYPE(0);
    let mut data: u32 = 0;
    let mut data_len: u32 = std::mem::size_of::<u32>() as u32;

    let status = unsafe {
        RegGetValueW(
            HKEY_CURRENT_USER,
            PCWSTR(path_w.as_ptr()),
            PCWSTR(value_w.as_ptr()),
            RRF_RT_REG_DWORD,
            Some(&mut data_type),
            Some(&mut data as *mut _ as *mut _),
            Some(&mut data_len),
        )
    };
    if status != WIN32_ERROR(0) { None } else { Some(data) }
}

#[cfg(target_os = "windows")]
fn system_proxy_from_registry() -> Option<SystemProxySettings> {
    let path = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";
    let enabled = read_registry_dword(path, "ProxyEnable")?;
    if enabled == 0 {
        return None;
    }
    let proxy_server = read_registry_string(path, "ProxyServer")?;
    let bypass = read_registry_string(path, "ProxyOverride");

    let mut settings = SystemProxySettings { bypass, ..Default::default() };
    if proxy_server.contains('=') {
        for part in proxy_server.split(';') {
            let Some((scheme, addr)) = part.split_once('=') else { continue };
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            match scheme.trim().to_ascii_lowercase().as_str() {
                "http" => settings.http = Some(addr.to_string()),
                "https" => settings.https = Some(addr.to_string()),
                "socks" | "socks5" => crate::logger::warn("http_client", "system proxy uses SOCKS, unsupported; ignoring"),
                _ => {}
            }
        }
    } else {
        let trimmed = proxy_server.trim();
        if !trimmed.is_empty() {
            settings.http = Some(trimmed.to_string());
            settings.https = Some(trimmed.to_string());
        }
    }

    if settings.http.is_none() && settings.https.is_none() { None } else { Some(settings) }
}

#[cfg(not(target_os = "windows"))]
fn system_proxy_from_registry() -> Option<SystemProxySettings> {
    None
}

fn create_proxies(cfg: &ProxyConfig) -> Vec<Proxy> {
    if !cfg.enabled {
        return Vec::new();
    }
    match cfg.proxy_type.as_str() {
        "none" => Vec::new(),
        "custom" => {
            let Some(url) = cfg.url.as_ref().map(|u| u.trim()).filter(|u| !u.is_empty()) else {
                crate::logger::warn("http_client", "proxy type is 'custom' but no url configured, ignoring");
                return Vec::new();
            };
            let mut proxy = match Proxy::all(normalize_proxy_url(url, "http")) {
                Ok(proxy) => proxy,
                Err(_) => {
                    crate::logger::warn("http_client", "failed to parse custom proxy url, ignoring");
                    return Vec::new();
                }
            };
            if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
                proxy = proxy.basic_auth(username, password);
            }
            if let Some(no_proxy) = build_no_proxy(cfg, None) {
                proxy = proxy.no_proxy(Some(no_proxy));
            }
            vec![proxy]
        }
        _ => {
            let Some(settings) = system_proxy_from_env().or_else(system_proxy_from_registry) else {
                return Vec::new();
            };
            let no_proxy = build_no_proxy(cfg, settings.bypass.as_deref());
            let mut proxies = Vec::new();
            if let Some(http) = settings.http.as_ref() {
                if let Ok(proxy) = Proxy::http(normalize_proxy_url(http, "http")) {
                    proxies.push(proxy);
                }
            }
            if let Some(https) = settings.https.as_ref() {
                if let Ok(proxy) = Proxy::https(normalize_proxy_url(https, "http")) {
                    proxies.push(proxy);
                }
            }
            if proxies.is_empty() {
                if let Some(url) = settings.https.as_ref().or(settings.http.as_ref()) {
                    if let Ok(proxy) = Proxy::all(normalize_proxy_url(url, "http")) {
                        proxies.push(proxy);
                    }
                }
            }
            if let Some(no_proxy) = no_proxy {
                proxies = proxies.into_iter().map(|p| p.no_proxy(Some(no_proxy.clone()))).collect();
            }
            proxies
        }
    }
}

/// Builds a client honoring the gateway-wide proxy config. Per-account proxy
/// overrides (`account.proxy_id`) are resolved by the caller before this is
/// invoked; this function only ever applies the global fallback.
pub fn create_client(timeout_secs: u64) -> Result<Client, GatewayError> {
    let cfg = config::load();
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs)).connect_timeout(Duration::from_secs(10));

    if let Some(proxy_cfg) = cfg.proxy.as_ref() {
        let proxies = create_proxies(proxy_cfg);
        if proxies.is_empty() && proxy_cfg.enabled {
            crate::logger::warn("http_client", &format!("proxy enabled but none resolved (type: {})", proxy_cfg.proxy_type));
        }
        for proxy in proxies {
            builder = builder.proxy(proxy);
        }
    }

    builder.build().map_err(|e| GatewayError::Internal(format!("failed to build http client: {e}")))
}

pub fn default_client() -> Result<Client, GatewayError> {
    create_client(120)
}

pub fn streaming_client() -> Result<Client, GatewayError> {
    create_client(300)
}

/// Same rule as `forward::client`: retry only on 5xx/429, never on other 4xx.
pub fn should_retry(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504 | 429)
}

pub struct RequestAttemptResult {
    pub response: Response,
    pub latency_ms: u64,
}

pub async fn make_request(client: &Client, url: &str, headers: HeaderMap, body: &Value) -> Result<RequestAttemptResult, GatewayError> {
    let start = Instant::now();
    let response = client.post(url).headers(headers).json(body).send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::UpstreamTransient(format!("timeout: {e}"))
        } else if e.is_connect() {
            GatewayError::UpstreamTransient(format!("connection failed: {e}"))
        } else {
            GatewayError::UpstreamTransient(e.to_string())
        }
    })?;
    let latency_ms = start.elapsed().as_millis() as u64;
    Ok(RequestAttemptResult { response, latency_ms })
}

/// Sends a POST, round-robining across `endpoints` and backing off with
/// `clock::backoff_delay` between attempts, per spec.md §4.7.
pub async fn send_with_retry(
    client: &Client,
    endpoints: &[String],
    path: &str,
    headers: HeaderMap,
    body: &Value,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> Result<RequestAttemptResult, GatewayError> {
    if endpoints.is_empty() {
        return Err(GatewayError::Internal("no endpoints configured".into()));
    }

    let mut attempt = 0u32;
    let mut endpoint_idx = 0usize;
    let mut last_error: Option<String> = None;

    loop {
        if attempt >= max_attempts {
            return Err(GatewayError::UpstreamTransient(format!(
                "max retries ({max_attempts}) exceeded, last error: {}",
                last_error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let endpoint = &endpoints[endpoint_idx];
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

        match make_request(client, &url, headers.clone(), body).await {
            Ok(result) => {
                let status = result.response.status();
                if status.is_success() {
                    return Ok(result);
                } else if !should_retry(status.as_u16()) {
                    let error_body = result.response.text().await.unwrap_or_default();
                    return Err(GatewayError::UpstreamClientError { status: status.as_u16(), body: error_body });
                } else {
                    last_error = Some(format!("HTTP {status}"));
                }
            }
            Err(e) => last_error = Some(e.to_string()),
        }

        attempt += 1;
        endpoint_idx = (endpoint_idx + 1) % endpoints.len();
        let base = Duration::from_millis(base_delay_ms);
        let cap = Duration::from_millis(max_delay_ms);
        let delay = crate::clock::with_jitter(crate::clock::backoff_delay(attempt, base, cap));
        tokio::time::sleep(delay).await;
    }
}

pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drains complete SSE lines from a byte buffer, handling reads that split a
/// line across chunk boundaries.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else { break };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_retry_matches_5xx_and_429_only() {
        assert!(should_retry(500));
        assert!(should_retry(429));
        assert!(!should_retry(400));
        assert!(!should_retry(401));
        assert!(!should_retry(200));
    }

    #[test]
    fn parse_sse_data_strips_prefix() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("event: message"), None);
    }

    #[test]
    fn drain_sse_lines_handles_split_chunks() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }
}
