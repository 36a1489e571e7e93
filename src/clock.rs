//! Monotonic time helpers and the exponential backoff formula shared by the
//! upstream retry loop (forward::retry) and the streaming forwarder.

use rand::RngCore;
use std::time::Duration;

/// Seconds since the Unix epoch, used for account cooldown fields which are
/// compared against wall-clock timestamps stored alongside account rows.
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `min(2^(attempt-1) * base, cap)`, attempt is 1-based.
///
/// Mirrors the teacher's `calculate_retry_delay` but fixed to the formula
/// spec.md §4.7 names explicitly: `min(2^(attempts-1) * 1s, 16s)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let scaled = base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
    scaled.min(cap)
}

/// Adds up to 25% jitter, same distribution the teacher uses (`OsRng`).
pub fn with_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rngs::OsRng;
    let mut buf = [0u8; 4];
    rng.fill_bytes(&mut buf);
    let frac = u32::from_le_bytes(buf) as f64 / u32::MAX as f64;
    let jitter = delay.mul_f64(frac * 0.25);
    delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_16s() {
        let d = backoff_delay(10, Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(d, Duration::from_secs(16));
    }

    #[test]
    fn backoff_first_attempt_is_base() {
        let d = backoff_delay(1, Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles() {
        let d = backoff_delay(3, Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(d, Duration::from_secs(4));
    }

    #[test]
    fn jitter_never_shrinks() {
        let base = Duration::from_millis(300);
        let jittered = with_jitter(base);
        assert!(jittered >= base);
        assert!(jittered <= base + base.mul_f64(0.25));
    }
}
