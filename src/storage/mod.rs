//! Event-accounting storage interface and backends (§4.5).
//!
//! Grounded on the `breaker_machines` native extension's
//! `storage::{StorageBackend, MemoryStorage, NullStorage}` and on
//! `riptide-utils::health_registry`'s `Arc<RwLock<HashMap<...>>>` concurrency
//! idiom.

mod bucket_memory;
mod fallback_chain;
mod memory;
mod null;

pub use bucket_memory::BucketMemoryStorage;
pub use fallback_chain::{BackendSpec, FallbackChainStorage};
pub use memory::MemoryStorage;
pub use null::NullStorage;

use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;

/// Minimal snapshot needed to reconstitute a circuit's state across
/// processes when a shared backend is used (§3 Storage status record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedState {
    /// Circuit is closed.
    Closed,
    /// Circuit is open.
    Open,
    /// Circuit is half-open.
    HalfOpen,
}

impl PersistedState {
    /// The exact string form used in the cache-backed key scheme (§6).
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistedState::Closed => "closed",
            PersistedState::Open => "open",
            PersistedState::HalfOpen => "half_open",
        }
    }
}

/// A persisted status record: `{state, opened_at?}` (§3).
#[derive(Debug, Clone, Copy)]
pub struct StatusRecord {
    /// The persisted state.
    pub state: PersistedState,
    /// Wall-clock seconds-since-epoch at which the circuit last opened, if
    /// currently open or half-open.
    pub opened_at: Option<f64>,
}

/// Storage interface required by a [`crate::circuit::Circuit`] (§4.5).
///
/// Implementations MUST be safe under concurrent access by multiple threads.
/// A storage fault must never bring a circuit down: callers treat a failed
/// `record_*` as "logged, not propagated" and a failed `*_count` read as zero
/// (§7 kind 5, fail-permissive for trip evaluation) — this contract is
/// enforced by [`crate::circuit::Circuit`], not by the trait itself.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Record a successful call.
    async fn record_success(&self, name: &str, duration: std::time::Duration) -> anyhow::Result<()>;

    /// Record a tracked failure.
    async fn record_failure(
        &self,
        name: &str,
        duration: std::time::Duration,
        error_info: Option<String>,
    ) -> anyhow::Result<()>;

    /// Count successes within the trailing `window_seconds`.
    async fn success_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64>;

    /// Count failures within the trailing `window_seconds`.
    async fn failure_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64>;

    /// Fetch the persisted status record, if any.
    async fn get_status(&self, name: &str) -> anyhow::Result<Option<StatusRecord>>;

    /// Persist a status record.
    async fn set_status(&self, name: &str, record: StatusRecord) -> anyhow::Result<()>;

    /// Clear all recorded events and status for one circuit.
    async fn clear(&self, name: &str) -> anyhow::Result<()>;

    /// Clear every circuit's recorded events and status.
    async fn clear_all(&self) -> anyhow::Result<()>;

    /// Most recent events for a circuit, most-recent-first, capped at `limit`.
    async fn event_log(&self, name: &str, limit: usize) -> anyhow::Result<Vec<Event>>;
}

/// The default storage backend for a circuit that does not specify one:
/// `BucketMemoryStorage`, per §4.5 ("This is the default.").
pub fn default_storage() -> Arc<dyn StorageBackend> {
    Arc::new(BucketMemoryStorage::new(60))
}
