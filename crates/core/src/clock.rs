//! Time source abstraction.
//!
//! Lock expiry, backoff and schedule evaluation all compare against "now".
//! Routing that through a [`Clock`] lets tests move time forward explicitly
//! instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Cloning shares the underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Starts at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Longest lease, lock TTL, timeout or delay the engine accepts.
pub const MAX_WINDOW: std::time::Duration = std::time::Duration::from_secs(366 * 24 * 60 * 60);

/// `at + d`, or `None` when the result is outside chrono's range.
pub fn checked_after(at: DateTime<Utc>, d: std::time::Duration) -> Option<DateTime<Utc>> {
    Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_all_clones() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let other = clock.clone();
        clock.advance(Duration::seconds(5));
        assert_eq!(
            other.now(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap()
        );
    }

    #[test]
    fn checked_after_refuses_unrepresentable_instants() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            checked_after(at, std::time::Duration::from_secs(60)),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap())
        );
        assert_eq!(
            checked_after(at, std::time::Duration::from_millis(10_000_000_000_000_000)),
            None
        );
        assert_eq!(checked_after(at, std::time::Duration::MAX), None);
    }
}
