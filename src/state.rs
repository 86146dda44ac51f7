//! Runtime transition state for a circuit (§4.1).
//!
//! Kept separate from [`crate::circuit::Circuit`] so the admission and
//! accounting logic in `circuit.rs` never has to reason about lock
//! ordering directly — every transition here is a single critical section.

use crate::event::CircuitState;
use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    reset_deadline: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

/// Compute a jittered Open -> HalfOpen deadline: `base * (1 +/- jitter)`,
/// `jitter` clamped to `[0, 1]` by the caller (`CircuitBuilder`).
pub(crate) fn jittered_deadline(now: Instant, base: Duration, jitter: f64) -> Instant {
    let factor = if jitter <= 0.0 { 0.0 } else { rand::thread_rng().gen_range(-jitter..=jitter) };
    let scaled = base.mul_f64((1.0 + factor).max(0.0));
    now + scaled
}

pub(crate) struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                reset_deadline: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the current state, first advancing Open -> HalfOpen if the
    /// jittered reset deadline has elapsed and `dependencies_ok` (every
    /// named upstream dependency is not `Open`, per §4.8's `attempt_recovery`
    /// guard).
    pub fn poll_transition(&self, now: Instant, dependencies_ok: bool) -> CircuitState {
        self.poll_transition_announced(now, dependencies_ok).0
    }

    /// Like [`Self::poll_transition`], but also reports whether *this call*
    /// was the one that advanced Open -> HalfOpen, so the caller can fire the
    /// `on_half_open` callback and `HalfOpened` event exactly once per entry
    /// (§4.1 "On entry to HalfOpen ... fire `on_half_open`") rather than on
    /// every subsequent read of an already-HalfOpen circuit.
    ///
    /// `dependencies_ok` gates the transition exactly as the §4.1 transition
    /// table describes it: the elapsed-time check and the dependency guard
    /// are both part of a single `attempt_recovery`, not two independent
    /// rejection reasons. When the guard denies recovery the circuit simply
    /// stays `Open` — callers see the ordinary `Open` rejection (and its
    /// fallback), never a distinct dependency error, matching §6's error
    /// taxonomy (`CircuitDependencyError` is a Group-level operation error,
    /// not a per-call one).
    pub fn poll_transition_announced(&self, now: Instant, dependencies_ok: bool) -> (CircuitState, bool) {
        let mut inner = self.lock();
        let mut entered_half_open = false;
        if inner.state == CircuitState::Open {
            if let Some(deadline) = inner.reset_deadline {
                if now >= deadline && dependencies_ok {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    entered_half_open = true;
                }
            }
        }
        (inner.state, entered_half_open)
    }

    /// Admit one half-open trial call, bounded by `max_calls` concurrent
    /// trials. Returns `false` if the circuit is not half-open or the trial
    /// slot cap is already reached.
    pub fn try_enter_half_open_trial(&self, max_calls: u32) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::HalfOpen || inner.half_open_in_flight >= max_calls {
            return false;
        }
        inner.half_open_in_flight += 1;
        true
    }

    /// Release a half-open trial slot taken by `try_enter_half_open_trial`.
    pub fn leave_half_open_trial(&self) {
        let mut inner = self.lock();
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }

    /// Record a half-open success. Returns `true` if this closes the circuit.
    pub fn record_half_open_success(&self, success_threshold: u32) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::HalfOpen {
            return false;
        }
        inner.half_open_successes += 1;
        if inner.half_open_successes >= success_threshold.max(1) {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.reset_deadline = None;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            true
        } else {
            false
        }
    }

    /// A half-open trial failed: reopen immediately with a fresh deadline.
    pub fn record_half_open_failure(&self, now: Instant, deadline: Instant) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.reset_deadline = Some(deadline);
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
    }

    /// Force the circuit open. Returns `true` if this was a fresh transition
    /// (it was not already open), which is when the caller should emit the
    /// `Opened` event and cascade.
    pub fn force_open(&self, now: Instant, deadline: Instant) -> bool {
        let mut inner = self.lock();
        let was_open = inner.state == CircuitState::Open;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.reset_deadline = Some(deadline);
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        !was_open
    }

    /// Force the circuit closed. Returns `true` if it was not already closed.
    pub fn force_close(&self) -> bool {
        let mut inner = self.lock();
        let changed = inner.state != CircuitState::Closed;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.reset_deadline = None;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        changed
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.lock().opened_at
    }

    /// Unconditional transition to `Closed`, bypassing every guard (§4.1
    /// `hard_reset`). Unlike [`Self::force_close`], the caller is not told
    /// whether this changed anything — `hard_reset` fires its side effects
    /// (storage clear, `on_close`) every time, even if the circuit was
    /// already closed.
    pub fn hard_reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.reset_deadline = None;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_zero_is_exact() {
        let now = Instant::now();
        let deadline = jittered_deadline(now, Duration::from_secs(10), 0.0);
        assert_eq!(deadline, now + Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let now = Instant::now();
        for _ in 0..50 {
            let deadline = jittered_deadline(now, Duration::from_secs(10), 0.5);
            assert!(deadline >= now + Duration::from_secs(5));
            assert!(deadline <= now + Duration::from_secs(15));
        }
    }

    #[test]
    fn half_open_admits_up_to_cap() {
        let sm = StateMachine::new();
        let now = Instant::now();
        sm.force_open(now, now);
        assert_eq!(sm.poll_transition(now + Duration::from_millis(1), true), CircuitState::HalfOpen);
        assert!(sm.try_enter_half_open_trial(2));
        assert!(sm.try_enter_half_open_trial(2));
        assert!(!sm.try_enter_half_open_trial(2));
        sm.leave_half_open_trial();
        assert!(sm.try_enter_half_open_trial(2));
    }

    #[test]
    fn half_open_success_threshold_closes() {
        let sm = StateMachine::new();
        let now = Instant::now();
        sm.force_open(now, now);
        sm.poll_transition(now + Duration::from_millis(1), true);
        assert!(!sm.record_half_open_success(2));
        assert!(sm.record_half_open_success(2));
        assert_eq!(sm.poll_transition(now, true), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let sm = StateMachine::new();
        let now = Instant::now();
        sm.force_open(now, now);
        sm.poll_transition(now + Duration::from_millis(1), true);
        sm.record_half_open_failure(now, now + Duration::from_secs(30));
        assert_eq!(sm.poll_transition(now, true), CircuitState::Open);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// §8: the Open -> HalfOpen deadline always lands within
            /// `base * (1 +/- jitter)` of `now`, for any base duration and
            /// jitter factor a builder could validate through.
            #[test]
            fn jittered_deadline_stays_within_bounds(base_millis in 1u64..=120_000, jitter in 0.0f64..=1.0) {
                let now = Instant::now();
                let base = Duration::from_millis(base_millis);
                let deadline = jittered_deadline(now, base, jitter);
                let lower = now + base.mul_f64((1.0 - jitter).max(0.0));
                let upper = now + base.mul_f64(1.0 + jitter);
                prop_assert!(deadline >= lower);
                prop_assert!(deadline <= upper);
            }
        }
    }
}
