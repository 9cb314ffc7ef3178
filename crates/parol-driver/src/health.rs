//! Link Health - lock-free counters updated by every query
//!
//! **App Start Relative Time Pattern**:
//! - Timestamps are microseconds since a process-wide monotonic anchor
//! - Unaffected by system clock changes
//! - Safe to store in `AtomicU64`

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static APP_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic time as microseconds since the anchor.
///
/// Never returns 0, which is reserved for "never".
fn monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64 + 1
}

/// Link health counters.
#[derive(Debug, Default)]
pub struct LinkHealth {
    queries: AtomicU64,
    successes: AtomicU64,
    timeouts: AtomicU64,
    malformed: AtomicU64,
    consecutive_failures: AtomicU32,
    /// 0 = never
    last_success_us: AtomicU64,
}

/// Point-in-time copy of [`LinkHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHealthSnapshot {
    pub queries: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub malformed_responses: u64,
    pub consecutive_failures: u32,
    /// Time since the last successful query, `None` if none succeeded yet.
    pub since_last_success: Option<Duration>,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_us
            .store(monotonic_micros(), Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_failure();
    }

    /// A datagram that failed to decode. Does not end the query.
    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time since the last successful query.
    pub fn since_last_success(&self) -> Option<Duration> {
        match self.last_success_us.load(Ordering::Relaxed) {
            0 => None,
            last => Some(Duration::from_micros(
                monotonic_micros().saturating_sub(last),
            )),
        }
    }

    pub fn snapshot(&self) -> LinkHealthSnapshot {
        LinkHealthSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            malformed_responses: self.malformed.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            since_last_success: self.since_last_success(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_monotonic_time_always_increases() {
        let t1 = monotonic_micros();
        thread::sleep(Duration::from_millis(5));
        let t2 = monotonic_micros();
        assert!(t2 > t1);
        assert!(t1 > 0);
    }

    #[test]
    fn test_initially_never_succeeded() {
        let health = LinkHealth::new();
        let snap = health.snapshot();
        assert_eq!(snap.queries, 0);
        assert_eq!(snap.since_last_success, None);
    }

    #[test]
    fn test_failures_reset_on_success() {
        let health = LinkHealth::new();
        health.record_query();
        health.record_timeout();
        health.record_query();
        health.record_malformed();
        health.record_timeout();
        assert_eq!(health.consecutive_failures(), 2);

        health.record_query();
        health.record_success();
        let snap = health.snapshot();
        assert_eq!(snap.queries, 3);
        assert_eq!(snap.timeouts, 2);
        assert_eq!(snap.malformed_responses, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.since_last_success.unwrap() < Duration::from_secs(1));
    }
}
