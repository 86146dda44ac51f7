//! Bounded-concurrency admission control (§4.4).
//!
//! Grounded on `riptide-utils::circuit_breaker::CircuitBreaker`'s
//! `half_open_permits: Arc<Semaphore>` field; generalized here into a
//! standalone non-blocking gate so it can guard the whole circuit (not just
//! the half-open trial window). Naming (`BulkheadGuard`) follows the
//! `breaker_machines` native extension's `bulkhead.rs`.

use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A non-blocking, instantaneous-capacity admission gate. No FIFO queueing:
/// a call either gets a permit immediately or is rejected.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    in_flight: Arc<AtomicU32>,
}

impl Bulkhead {
    /// Create a bulkhead with the given capacity.
    pub fn new(capacity: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Try to acquire one permit without blocking. Returns `None` if the
    /// bulkhead is saturated.
    pub fn try_acquire(&self) -> Option<BulkheadGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Relaxed);
        Some(BulkheadGuard { _permit: permit, counter: Arc::clone(&self.in_flight) })
    }

    /// Current number of in-flight (admitted, not yet completed) calls.
    /// Invariant: `in_flight() <= capacity()` at every observation point (§8).
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Relaxed)
    }

    /// Configured capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// RAII guard released on drop, decrementing both the semaphore permit count
/// and the in-flight counter.
pub struct BulkheadGuard {
    _permit: OwnedSemaphorePermit,
    counter: Arc<AtomicU32>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Relaxed);
    }
}
