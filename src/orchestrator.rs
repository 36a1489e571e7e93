//! C12 — orchestrator: the spec.md §4.8 per-request algorithm. Grounded on
//! `forward/mod.rs`'s `handle_request_with_fallback` retry/fallback loop
//! (excluded-id accumulation, retry budget, slot release on every exit path),
//! generalized from "loop over model routes" to the full user-slot ->
//! scheduler -> account-slot -> token -> forward -> billing -> deferred ->
//! log -> release sequence.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use axum::response::Response;
use serde_json::Value;

use crate::gateway_error::GatewayError;
use crate::model::{Platform, User};
use crate::scheduler::{SchedulerError, SelectRequest};

/// Scheduling retries per request, spec.md §4.8 step 3 ("loop ≤
/// retry_budget"). Distinct from `forward::MAX_ATTEMPTS`, which bounds HTTP
/// retries against a single already-selected account.
const RETRY_BUDGET: u32 = 3;

/// Bound on how long a request waits for a user concurrency slot to free up
/// before returning 429, matching the 30 s background-deadline budget the
/// token provider's single-flight lock already uses elsewhere in this crate.
const USER_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OrchestrateRequest<'a> {
    pub user: &'a User,
    /// The inbound wire protocol (also the scheduler's candidate-pool
    /// platform; antigravity accounts with `mixed_scheduling` are folded in
    /// automatically by `scheduler::select` when this is anthropic/gemini).
    pub client_protocol: Platform,
    pub model: &'a str,
    pub streaming: bool,
    pub body: Value,
    pub session_fingerprint: Option<&'a str>,
    pub group_id: Option<i64>,
}

async fn acquire_user_slot(user: &User) -> Result<crate::concurrency::SlotGuard, GatewayError> {
    let owner = format!("user:{}", user.id);
    if let Some(guard) = crate::concurrency::acquire_slot(&owner, user.concurrency).await {
        return Ok(guard);
    }

    let limit = crate::concurrency::max_wait(user.concurrency);
    if !crate::concurrency::incr_wait(&owner, limit).await {
        return Err(GatewayError::Concurrency);
    }

    let deadline = Instant::now() + USER_WAIT_TIMEOUT;
    let result = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(guard) = crate::concurrency::acquire_slot(&owner, user.concurrency).await {
            break Ok(guard);
        }
        if Instant::now() >= deadline {
            break Err(GatewayError::Concurrency);
        }
    };
    crate::concurrency::decr_wait(&owner).await;
    result
}

/// Runs the full spec.md §4.8 happy-path algorithm for one inbound request.
/// Caller is expected to have already authenticated the request and resolved
/// `user`/`client_protocol` from the route ("authenticate externally" per
/// §4.8 step 1).
pub async fn handle(req: OrchestrateRequest<'_>) -> Result<Response, GatewayError> {
    if req.user.status != crate::model::AccountStatus::Active {
        return Err(GatewayError::Auth("user account is disabled".to_string()));
    }

    let user_guard = acquire_user_slot(req.user).await?;

    let mut excluded: HashSet<i64> = HashSet::new();
    let mut attempts = 0u32;

    let (account, response, outcome) = loop {
        attempts += 1;
        if attempts > RETRY_BUDGET {
            return Err(GatewayError::Scheduling);
        }

        let select_req = SelectRequest {
            group_id: req.group_id,
            session_fingerprint: req.session_fingerprint,
            model: req.model,
            excluded_ids: &excluded,
            platform: req.client_protocol,
        };
        let account = match crate::scheduler::select(&select_req, crate::clock::now_epoch_secs()) {
            Ok(a) => a,
            Err(SchedulerError::NoAvailableAccounts) => return Err(GatewayError::Scheduling),
        };

        // spec.md §3 "allowed-group list restricts scheduling scope": a
        // non-empty list on the user is an allow-list over account groups.
        if !req.user.allowed_groups.is_empty() {
            let in_scope = account.group_id.map(|g| req.user.allowed_groups.contains(&g)).unwrap_or(false);
            if !in_scope {
                excluded.insert(account.id);
                continue;
            }
        }

        let account_owner = format!("account:{}", account.id);
        let Some(account_guard) = crate::concurrency::acquire_slot(&account_owner, account.concurrency).await else {
            excluded.insert(account.id);
            continue;
        };

        let token = match crate::token_provider::get_access_token(&account).await {
            Ok(t) => t,
            Err(GatewayError::TokenRefresh { recoverable: true, .. }) => {
                account_guard.release().await;
                excluded.insert(account.id);
                continue;
            }
            Err(e) => {
                account_guard.release().await;
                return Err(e);
            }
        };

        match crate::forward::forward(&account, req.client_protocol, &token, req.model, req.streaming, req.body.clone()).await {
            Ok((response, outcome)) => {
                account_guard.release().await;
                break (account, response, outcome);
            }
            Err(GatewayError::UpstreamFailover { .. }) => {
                account_guard.release().await;
                excluded.insert(account.id);
                continue;
            }
            Err(e) => {
                account_guard.release().await;
                return Err(e);
            }
        }
    };

    let pricing_entry = crate::pricing::lookup(&outcome.model).unwrap_or(crate::model::PricingEntry {
        input_per_token: 0.0,
        output_per_token: 0.0,
        cache_creation_per_token: 0.0,
        cache_read_per_token: 0.0,
        supports_prompt_caching: false,
        cache_creation_5m_per_token: None,
        cache_creation_1h_per_token: None,
    });
    let cost = crate::billing::calculate(&pricing_entry, &outcome.usage, req.user.rate_multiplier);

    // spec.md §4.8 step 5/6: last-used touch and the usage log are both
    // best-effort side effects, run after the client-visible response is
    // already decided.
    crate::deferred::schedule_last_used(account.id, crate::clock::now_epoch_secs());
    crate::db::log_usage(
        account.platform.as_str(),
        &account.name,
        &outcome.model,
        outcome.usage.input_tokens,
        outcome.usage.output_tokens,
        outcome.usage.total(),
        cost.actual_cost,
        &outcome.request_id,
    );

    user_guard.release().await;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_is_three_per_spec() {
        assert_eq!(RETRY_BUDGET, 3);
    }
}
