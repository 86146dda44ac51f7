//! Clock abstraction separating monotonic timing from wall-clock status
//! timestamps (§3, §5).
//!
//! `opened_at`, `effective_reset_timeout`, and the trip-evaluation window are
//! all monotonic — they must never jump backwards when the system clock is
//! adjusted (NTP, leap seconds). Persisted status records, on the other hand,
//! need a wall-clock timestamp so a value written by one process can be read
//! back by another. `Clock` exposes both.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Abstracted time source. Injectable so tests can advance time deterministically
/// instead of sleeping.
///
/// Grounded on `riptide-utils::circuit_breaker::Clock` (`now_ms` abstraction);
/// extended with a monotonic `Instant` accessor and a wall-clock accessor
/// since this crate's state machine needs both (monotonic for recovery-delay
/// arithmetic, wall-clock for the persisted status record in §6).
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant. Used for all recovery-timing arithmetic.
    fn now(&self) -> Instant;

    /// Current wall-clock time as seconds since the Unix epoch. Used only for
    /// the persisted status record's `opened_at` field.
    fn wall_now_secs(&self) -> f64;
}

/// Real system clock.
#[derive(Default, Debug, Clone, Copy)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now_secs(&self) -> f64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => {
                tracing::error!(error = %e, "system time is before Unix epoch");
                0.0
            }
        }
    }
}

/// Deterministic clock for tests. Starts at an arbitrary monotonic origin and
/// only advances when told to, mirroring
/// `riptide-utils::circuit_breaker::tests::TestClock`.
#[derive(Debug)]
pub struct TestClock {
    origin: Instant,
    offset_ms: AtomicU64,
    wall_origin_secs: f64,
}

impl Default for TestClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: AtomicU64::new(0),
            wall_origin_secs: 1_700_000_000.0,
        }
    }
}

impl TestClock {
    /// Create a new test clock pinned at the current instant.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advance both the monotonic and wall-clock views by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.offset_ms.fetch_add(duration.as_millis() as u64, Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_millis(self.offset_ms.load(Relaxed))
    }

    fn wall_now_secs(&self) -> f64 {
        self.wall_origin_secs + (self.offset_ms.load(Relaxed) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_clock_monotonic_non_decreasing() {
        let clock = RealClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn real_clock_wall_now_is_plausible() {
        let clock = RealClock;
        assert!(clock.wall_now_secs() > 1_600_000_000.0);
    }

    #[test]
    fn test_clock_advances_deterministically() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }

    #[test]
    fn test_clock_wall_time_tracks_offset() {
        let clock = TestClock::new();
        let w0 = clock.wall_now_secs();
        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.wall_now_secs(), w0 + 10.0);
    }
}
