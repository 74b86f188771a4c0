//! Reconnect delay policy.
//!
//! The default is a fixed delay between attempts. Growth and jitter are opt-in
//! tunables for endpoints where a fixed-interval retry loop is too aggressive.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default delay before reconnecting after an unexpected close.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1500);

/// Policy controlling automatic reconnection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether an unexpected close schedules a new attempt at all.
    pub enabled: bool,
    /// Delay used before the first reconnect attempt.
    pub delay: Duration,
    /// Upper bound for delay growth. Equal to `delay` for a fixed interval.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Retries forever with the same delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            enabled: true,
            delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based and counts consecutive closes since the last
    /// successful open.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let cap = self.max_delay.max(self.delay);
        let mut delay = self.delay;
        for _ in 1..attempt {
            if delay >= cap {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), cap);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
