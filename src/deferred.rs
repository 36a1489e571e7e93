//! C9 — deferred writer: batches `last_used_at` touches off the request hot
//! path and flushes them on a timer, per spec.md §4.6.
//!
//! Grounded on `logger`'s `spawn_batch_writer` (buffer + timed flush on a
//! dedicated loop) and `db::log_usage`'s upsert pattern, generalized here
//! from "insert a log row" to "coalesce the latest timestamp per account".

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

static PENDING: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

const FLUSH_DEADLINE: Duration = Duration::from_secs(10);

/// Records that `account_id` was used at `now`; coalesces with any
/// not-yet-flushed touch for the same account (last write wins).
pub fn schedule_last_used(account_id: i64, now: i64) {
    let mut pending = PENDING.lock().unwrap();
    let slot = pending.entry(account_id).or_insert(now);
    if now > *slot {
        *slot = now;
    }
}

/// Drains the pending map and applies every touch to the account store,
/// each under a bounded deadline so a stuck store lock cannot wedge the
/// flush loop forever.
async fn flush_once() {
    let batch: Vec<(i64, i64)> = {
        let mut pending = PENDING.lock().unwrap();
        pending.drain().collect()
    };
    if batch.is_empty() {
        return;
    }

    let result = tokio::time::timeout(FLUSH_DEADLINE, async {
        for (account_id, touched_at) in &batch {
            crate::accounts::touch_last_used(*account_id, *touched_at);
        }
    })
    .await;

    if result.is_err() {
        crate::logger::warn(
            "deferred",
            &format!("last_used flush missed its {}s deadline, re-queueing {} entries", FLUSH_DEADLINE.as_secs(), batch.len()),
        );
        let mut pending = PENDING.lock().unwrap();
        for (account_id, touched_at) in batch {
            let slot = pending.entry(account_id).or_insert(touched_at);
            if touched_at > *slot {
                *slot = touched_at;
            }
        }
    }
}

/// Spawns the background flush loop. `interval_secs` should be 10-30 per
/// spec.md §4.6; callers pick within that range based on expected request
/// volume.
pub fn spawn_flush_loop(interval_secs: u64) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            flush_once().await;
        }
    })
}

/// Synchronous best-effort flush for shutdown, per spec.md §4.6 "a shutdown
/// flushes whatever remains rather than dropping it".
pub fn flush_blocking() {
    let batch: Vec<(i64, i64)> = {
        let mut pending = PENDING.lock().unwrap();
        pending.drain().collect()
    };
    for (account_id, touched_at) in batch {
        crate::accounts::touch_last_used(account_id, touched_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountEntry, Settings};

    fn setup_account(id: i64) {
        crate::accounts::reload_from_config(&Settings {
            accounts: vec![AccountEntry {
                id,
                name: format!("acc-{id}"),
                display_name: format!("acc-{id}"),
                platform: "anthropic".to_string(),
                account_type: "apikey".to_string(),
                status: "active".to_string(),
                schedulable: true,
                concurrency: 1,
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    #[test]
    fn coalesces_to_latest_timestamp() {
        schedule_last_used(42, 100);
        schedule_last_used(42, 50);
        schedule_last_used(42, 200);
        let pending = PENDING.lock().unwrap();
        assert_eq!(pending.get(&42), Some(&200));
    }

    #[test]
    fn blocking_flush_applies_pending_touches() {
        setup_account(7);
        schedule_last_used(7, 555);
        flush_blocking();
        let acc = crate::accounts::get(7).unwrap();
        assert_eq!(acc.last_used_at, Some(555));
    }
}
