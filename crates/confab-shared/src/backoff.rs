//! Exponential backoff with attenuated jitter.
//!
//! Used by the online tracker's offline probes, the socket reconnect
//! scheduler, and the sync queue's transient-error retries. The jitter
//! term spreads reconnection load across many clients after a shared
//! outage.

use std::time::Duration;

/// Seconds to wait before attempt `attempt`, bounded by `max_secs`.
///
/// The deterministic component is `min(max_secs, 2^attempt / 10)`. The
/// jitter component is a random fraction of a second, scaled down for
/// early attempts (where a full second would dwarf the base wait) and
/// approaching one second for later ones.
pub fn exponential_backoff_secs(max_secs: f64, attempt: u32) -> f64 {
    let exponent = attempt.min(52);
    let base = (2f64.powi(exponent as i32) / 10.0).min(max_secs);
    let mut jitter: f64 = rand::random();
    if attempt < 2 {
        jitter /= 4.0;
    } else if attempt < 6 {
        jitter /= 2.0;
    }
    base + jitter
}

/// [`exponential_backoff_secs`] as a `Duration`, for timer scheduling.
pub fn exponential_backoff(max_secs: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64(exponential_backoff_secs(max_secs, attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_never_exceeds_max_plus_jitter() {
        for attempt in 0..60 {
            let wait = exponential_backoff_secs(30.0, attempt);
            assert!(wait <= 31.0, "attempt {attempt} gave {wait}");
            assert!(wait >= 0.0);
        }
    }

    #[test]
    fn test_backoff_base_is_monotonic() {
        // Strip jitter by comparing the deterministic component only.
        let base = |n: u32| (2f64.powi(n as i32) / 10.0).min(30.0);
        for n in 0..13 {
            assert!(base(n + 1) >= base(n));
        }
        // Early attempts are sub-second; later ones approach the cap.
        assert!(base(0) < 1.0);
        assert!((base(13) - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_jitter_is_attenuated_early() {
        for _ in 0..50 {
            let w0 = exponential_backoff_secs(30.0, 0);
            // base = 0.1, jitter < 0.25
            assert!(w0 < 0.36);
            let w3 = exponential_backoff_secs(30.0, 3);
            // base = 0.8, jitter < 0.5
            assert!(w3 < 1.31);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let wait = exponential_backoff_secs(30.0, u32::MAX);
        assert!(wait <= 31.0);
    }
}
