//! C4 — concurrency controller: account/user slot acquisition, wait-queue
//! counters, batch load snapshots.
//!
//! Grounded on `forward::limits`'s `LimitGuard`: a `Drop` impl that releases
//! state on a background task so a cancelled request can't leak a slot.
//! Here the release additionally waits out a 5 s background deadline
//! (spec.md §4.2/§5) instead of firing immediately, since the source system
//! explicitly calls for cancellation-proof release with that bound.

use once_cell::sync::Lazy;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    inserted_at: Instant,
}

#[derive(Default)]
struct OwnerSlots {
    members: HashMap<String, SlotEntry>,
    waiting: u32,
}

#[derive(Default)]
struct ConcurrencyState {
    owners: HashMap<String, OwnerSlots>,
}

static STATE: Lazy<Arc<Mutex<ConcurrencyState>>> =
    Lazy::new(|| Arc::new(Mutex::new(ConcurrencyState::default())));

pub fn request_id() -> String {
    let mut rng = rand::rngs::OsRng;
    let mut buf = [0u8; 8];
    rng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RAII handle returned by `acquire_slot`. Dropping it schedules release on a
/// background task bounded by a 5 s deadline, independent of whatever
/// context the caller was running in — this is what makes cancellation
/// slot-safe (spec.md P7).
pub struct SlotGuard {
    owner: String,
    member_id: String,
    released: bool,
}

impl SlotGuard {
    /// Explicit, awaited release. Prefer this on the orchestrator's happy
    /// path; `Drop` is the safety net for cancelled/panicking paths.
    pub async fn release(mut self) {
        self.released = true;
        release_owner_member(&self.owner, &self.member_id).await;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let owner = self.owner.clone();
        let member_id = self.member_id.clone();
        tokio::spawn(async move {
            let deadline = Duration::from_secs(5);
            let _ = tokio::time::timeout(deadline, release_owner_member(&owner, &member_id)).await;
        });
    }
}

async fn release_owner_member(owner: &str, member_id: &str) {
    let mut state = STATE.lock().await;
    if let Some(slots) = state.owners.get_mut(owner) {
        slots.members.remove(member_id);
    }
}

/// Acquires a slot for `owner` (an account id or user id namespaced by the
/// caller, e.g. `"account:42"` / `"user:7"`), conditional on
/// `|set| < cap`. `cap <= 0` means unlimited (spec.md §4.2).
pub async fn acquire_slot(owner: &str, cap: i64) -> Option<SlotGuard> {
    let mut state = STATE.lock().await;
    let slots = state.owners.entry(owner.to_string()).or_default();
    if cap > 0 && slots.members.len() as i64 >= cap {
        return None;
    }
    let member_id = request_id();
    slots.members.insert(member_id.clone(), SlotEntry { inserted_at: Instant::now() });
    Some(SlotGuard { owner: owner.to_string(), member_id, released: false })
}

pub async fn current(owner: &str) -> i64 {
    let state = STATE.lock().await;
    state.owners.get(owner).map(|s| s.members.len() as i64).unwrap_or(0)
}

/// `CalculateMaxWait(userConcurrency) = max(userConcurrency, 1) + 20`.
pub fn max_wait(concurrency: i64) -> i64 {
    concurrency.max(1) + 20
}

/// Compare-and-set bounded increment. On a genuine backing-store outage this
/// would fail open (allow + warn); this in-process implementation cannot
/// itself go down independently of the process, so it always evaluates the
/// bound directly, matching the "fail open" intent trivially.
pub async fn incr_wait(owner: &str, limit: i64) -> bool {
    let mut state = STATE.lock().await;
    let slots = state.owners.entry(owner.to_string()).or_default();
    if slots.waiting as i64 >= limit {
        return false;
    }
    slots.waiting += 1;
    true
}

pub async fn decr_wait(owner: &str) {
    let mut state = STATE.lock().await;
    if let Some(slots) = state.owners.get_mut(owner) {
        slots.waiting = slots.waiting.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadInfo {
    pub current_concurrency: i64,
    pub waiting_count: i64,
    pub load_rate: f64,
}

/// Batch load snapshot for a set of accounts in one round trip.
pub async fn batch_load(accounts: &[(i64, i64)]) -> HashMap<i64, LoadInfo> {
    let state = STATE.lock().await;
    let mut out = HashMap::with_capacity(accounts.len());
    for (id, cap) in accounts {
        let owner = format!("account:{id}");
        let (cur, waiting) = state
            .owners
            .get(&owner)
            .map(|s| (s.members.len() as i64, s.waiting as i64))
            .unwrap_or((0, 0));
        let load_rate = if *cap > 0 { 100.0 * cur as f64 / *cap as f64 } else { 0.0 };
        out.insert(*id, LoadInfo { current_concurrency: cur, waiting_count: waiting, load_rate });
    }
    out
}

/// Prunes slot members older than `ttl`. Intended to run on a fixed
/// interval background task, walking every known owner (spec.md §4.2:
/// "entries older than a configured TTL... are pruned by a dedicated
/// background task").
pub async fn cleanup_expired(ttl: Duration) {
    let mut state = STATE.lock().await;
    let now = Instant::now();
    for slots in state.owners.values_mut() {
        slots.members.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
    }
}

/// Spawns the background TTL-pruning task. `request_timeout` is doubled per
/// spec.md §4.2's default (`request timeout x 2`).
pub fn spawn_cleanup_task(request_timeout: Duration, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cleanup_expired(request_timeout * 2).await;
        }
    });
}

#[allow(dead_code)]
fn known_owners_snapshot() -> HashSet<String> {
    HashSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_respects_cap() {
        let owner = "account:test-cap";
        let g1 = acquire_slot(owner, 1).await;
        assert!(g1.is_some());
        let g2 = acquire_slot(owner, 1).await;
        assert!(g2.is_none());
        g1.unwrap().release().await;
        let g3 = acquire_slot(owner, 1).await;
        assert!(g3.is_some());
    }

    #[tokio::test]
    async fn cap_zero_is_unlimited() {
        let owner = "account:test-unlimited";
        let mut guards = Vec::new();
        for _ in 0..50 {
            guards.push(acquire_slot(owner, 0).await.unwrap());
        }
        assert_eq!(current(owner).await, 50);
    }

    #[tokio::test]
    async fn drop_without_explicit_release_still_frees_the_slot() {
        let owner = "account:test-drop";
        {
            let _g = acquire_slot(owner, 1).await.unwrap();
            assert_eq!(current(owner).await, 1);
        }
        // Drop spawned a background release task; give it a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(current(owner).await, 0);
    }

    #[tokio::test]
    async fn wait_counter_bounded() {
        let owner = "user:test-wait";
        let limit = max_wait(1);
        assert_eq!(limit, 21);
        for _ in 0..21 {
            assert!(incr_wait(owner, limit).await);
        }
        assert!(!incr_wait(owner, limit).await);
        decr_wait(owner).await;
        assert!(incr_wait(owner, limit).await);
    }
}
