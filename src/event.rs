//! Event data model (§3) and the observable event vocabulary (§6).
//!
//! Two distinct things live here and must not be confused:
//! - [`Event`] is the per-call record the storage layer counts and windows.
//! - [`BreakerEvent`] is the richer, named vocabulary
//!   (`breaker_machines.opened`, `storage_operation.breaker_machines`, ...)
//!   that callers can observe through an [`EventSink`]. Only the vocabulary is
//!   specified; routing it to a metrics/logging system is a host concern.

use std::time::Duration;

/// Whether a recorded [`Event`] represents a success or a tracked failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The operation completed without a tracked error.
    Success,
    /// The operation raised an error the classifier tracks as a failure.
    Failure,
}

/// An immutable record of one call's outcome (§3 Event).
///
/// `timestamp` is a monotonic offset in milliseconds from an arbitrary origin
/// chosen by the storage backend at construction time — it is never compared
/// across processes, only within a single backend's buffer.
#[derive(Debug, Clone)]
pub struct Event {
    /// Success or failure.
    pub kind: EventKind,
    /// Monotonic timestamp in milliseconds since the storage backend's origin.
    pub timestamp_ms: u64,
    /// How long the operation took, if known.
    pub duration: Option<Duration>,
    /// Optional error class name, for the event log only — never used for
    /// counting.
    pub error_class: Option<String>,
    /// Optional error message, for the event log only.
    pub message: Option<String>,
}

impl Event {
    /// Build a success event at the given monotonic timestamp.
    pub fn success(timestamp_ms: u64, duration: Duration) -> Self {
        Self {
            kind: EventKind::Success,
            timestamp_ms,
            duration: Some(duration),
            error_class: None,
            message: None,
        }
    }

    /// Build a failure event at the given monotonic timestamp.
    pub fn failure(
        timestamp_ms: u64,
        duration: Duration,
        error_class: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            kind: EventKind::Failure,
            timestamp_ms,
            duration: Some(duration),
            error_class,
            message,
        }
    }
}

/// The circuit's state, duplicated here (rather than imported from
/// [`crate::state`]) so the event vocabulary has a stable, serializable
/// representation independent of the internal transition representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls.
    Open,
    /// Testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// The named event vocabulary from §6. Event names must match exactly for
/// test verifiability, so each variant documents its wire name.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// `breaker_machines.opened`
    Opened {
        /// Circuit name.
        circuit: String,
        /// Failure count that triggered the trip, if count-mode.
        failure_count: Option<u64>,
    },
    /// `breaker_machines.closed`
    Closed {
        /// Circuit name.
        circuit: String,
    },
    /// `breaker_machines.half_opened`
    HalfOpened {
        /// Circuit name.
        circuit: String,
    },
    /// `breaker_machines.rejected`
    Rejected {
        /// Circuit name.
        circuit: String,
        /// State at the time of rejection.
        state: CircuitState,
    },
    /// `breaker_machines.success`
    Success {
        /// Circuit name.
        circuit: String,
        /// How long the call took.
        duration: Duration,
    },
    /// `breaker_machines.failure`
    Failure {
        /// Circuit name.
        circuit: String,
        /// How long the call took.
        duration: Duration,
        /// Error class, if known.
        error_class: Option<String>,
    },
    /// `breaker_machines.bulkhead_rejected`
    BulkheadRejected {
        /// Circuit name.
        circuit: String,
        /// Configured bulkhead capacity.
        max_concurrent: u32,
    },
    /// `storage_operation.breaker_machines`
    StorageOperation {
        /// Circuit name the event was recorded for.
        circuit: String,
        /// Backend name/index that served the operation.
        backend: String,
        /// Backend position in the chain (0-based).
        backend_index: usize,
        /// How long the backend operation took.
        duration: Duration,
    },
    /// `storage_fallback.breaker_machines`
    StorageFallback {
        /// Circuit name.
        circuit: String,
        /// Backend that failed.
        backend: String,
        /// Error class of the failure.
        error_class: String,
        /// Name of the backend that will be tried next, if any.
        next_backend: Option<String>,
    },
    /// `storage_backend_health.breaker_machines`
    StorageBackendHealth {
        /// Backend whose health changed.
        backend: String,
        /// Whether the backend is now marked unhealthy.
        unhealthy: bool,
    },
    /// `storage_chain_operation.breaker_machines`
    StorageChainOperation {
        /// Whether the chain ultimately succeeded.
        success: bool,
        /// Backends attempted, in order.
        attempted: Vec<String>,
    },
}

impl BreakerEvent {
    /// The §6 payload shape for this event as a host-agnostic JSON value:
    /// every variant carries at least `{circuit}` plus timing where it
    /// applies, and the four storage events additionally carry
    /// `{backend, backend_index, duration_ms, error_class?, next_backend?}`.
    /// Grounded on `riptide_types::types::EventRecord::custom_data`'s
    /// `HashMap<String, serde_json::Value>` convention for host-emitted,
    /// loosely-typed event payloads (non-goal: routing it anywhere — this
    /// crate only shapes the vocabulary, per spec.md §6).
    pub fn payload(&self) -> serde_json::Value {
        match self {
            BreakerEvent::Opened { circuit, failure_count } => {
                serde_json::json!({ "circuit": circuit, "failure_count": failure_count })
            }
            BreakerEvent::Closed { circuit } => serde_json::json!({ "circuit": circuit }),
            BreakerEvent::HalfOpened { circuit } => serde_json::json!({ "circuit": circuit }),
            BreakerEvent::Rejected { circuit, state } => {
                serde_json::json!({ "circuit": circuit, "state": state.to_string() })
            }
            BreakerEvent::Success { circuit, duration } => {
                serde_json::json!({ "circuit": circuit, "duration_ms": duration.as_millis() as u64 })
            }
            BreakerEvent::Failure { circuit, duration, error_class } => {
                serde_json::json!({
                    "circuit": circuit,
                    "duration_ms": duration.as_millis() as u64,
                    "error_class": error_class,
                })
            }
            BreakerEvent::BulkheadRejected { circuit, max_concurrent } => {
                serde_json::json!({ "circuit": circuit, "max_concurrent": max_concurrent })
            }
            BreakerEvent::StorageOperation { circuit, backend, backend_index, duration } => {
                serde_json::json!({
                    "circuit": circuit,
                    "backend": backend,
                    "backend_index": backend_index,
                    "duration_ms": duration.as_millis() as u64,
                })
            }
            BreakerEvent::StorageFallback { circuit, backend, error_class, next_backend } => {
                serde_json::json!({
                    "circuit": circuit,
                    "backend": backend,
                    "error_class": error_class,
                    "next_backend": next_backend,
                })
            }
            BreakerEvent::StorageBackendHealth { backend, unhealthy } => {
                serde_json::json!({ "backend": backend, "unhealthy": unhealthy })
            }
            BreakerEvent::StorageChainOperation { success, attempted } => {
                serde_json::json!({ "success": success, "attempted": attempted })
            }
        }
    }

    /// The exact wire name used for test verifiability (§6).
    pub fn name(&self) -> &'static str {
        match self {
            BreakerEvent::Opened { .. } => "breaker_machines.opened",
            BreakerEvent::Closed { .. } => "breaker_machines.closed",
            BreakerEvent::HalfOpened { .. } => "breaker_machines.half_opened",
            BreakerEvent::Rejected { .. } => "breaker_machines.rejected",
            BreakerEvent::Success { .. } => "breaker_machines.success",
            BreakerEvent::Failure { .. } => "breaker_machines.failure",
            BreakerEvent::BulkheadRejected { .. } => "breaker_machines.bulkhead_rejected",
            BreakerEvent::StorageOperation { .. } => "storage_operation.breaker_machines",
            BreakerEvent::StorageFallback { .. } => "storage_fallback.breaker_machines",
            BreakerEvent::StorageBackendHealth { .. } => "storage_backend_health.breaker_machines",
            BreakerEvent::StorageChainOperation { .. } => "storage_chain_operation.breaker_machines",
        }
    }
}

/// Host-supplied sink for [`BreakerEvent`]s. The crate emits events through
/// this trait and also always logs via `tracing`; routing events to a metrics
/// system is left to the implementation (non-goal: "logging and metric
/// emission sinks").
pub trait EventSink: Send + Sync {
    /// Called once per emitted event, after the triggering state change has
    /// committed.
    fn emit(&self, event: BreakerEvent);
}

/// An [`EventSink`] that logs every event via `tracing` and otherwise
/// discards it. Used as the default sink so circuits are observable without
/// any host wiring.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BreakerEvent) {
        match &event {
            BreakerEvent::Opened { circuit, failure_count } => {
                tracing::warn!(circuit = %circuit, failure_count = ?failure_count, event = event.name(), "circuit opened");
            }
            BreakerEvent::Closed { circuit } => {
                tracing::info!(circuit = %circuit, event = event.name(), "circuit closed");
            }
            BreakerEvent::HalfOpened { circuit } => {
                tracing::info!(circuit = %circuit, event = event.name(), "circuit half-open");
            }
            BreakerEvent::Rejected { circuit, state } => {
                tracing::warn!(circuit = %circuit, state = %state, event = event.name(), "call rejected");
            }
            BreakerEvent::Success { circuit, duration } => {
                tracing::debug!(circuit = %circuit, duration_ms = duration.as_millis() as u64, event = event.name(), "call succeeded");
            }
            BreakerEvent::Failure { circuit, duration, error_class } => {
                tracing::warn!(circuit = %circuit, duration_ms = duration.as_millis() as u64, error_class = ?error_class, event = event.name(), "call failed");
            }
            BreakerEvent::BulkheadRejected { circuit, max_concurrent } => {
                tracing::warn!(circuit = %circuit, max_concurrent, event = event.name(), "bulkhead rejected call");
            }
            BreakerEvent::StorageOperation { circuit, backend, backend_index, duration } => {
                tracing::debug!(circuit = %circuit, backend = %backend, backend_index, duration_ms = duration.as_millis() as u64, event = event.name(), "storage operation succeeded");
            }
            BreakerEvent::StorageFallback { circuit, backend, error_class, next_backend } => {
                tracing::warn!(circuit = %circuit, backend = %backend, error_class = %error_class, next_backend = ?next_backend, event = event.name(), "storage backend failed, falling back");
            }
            BreakerEvent::StorageBackendHealth { backend, unhealthy } => {
                tracing::warn!(backend = %backend, unhealthy, event = event.name(), "storage backend health changed");
            }
            BreakerEvent::StorageChainOperation { success, attempted } => {
                tracing::debug!(success, attempted = ?attempted, event = event.name(), "storage chain operation complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_vocabulary_exactly() {
        assert_eq!(
            BreakerEvent::Opened { circuit: "x".into(), failure_count: Some(3) }.name(),
            "breaker_machines.opened"
        );
        assert_eq!(
            BreakerEvent::StorageBackendHealth { backend: "cache".into(), unhealthy: true }.name(),
            "storage_backend_health.breaker_machines"
        );
    }

    #[test]
    fn tracing_sink_does_not_panic_on_any_variant() {
        let sink = TracingEventSink;
        sink.emit(BreakerEvent::Closed { circuit: "a".into() });
        sink.emit(BreakerEvent::BulkheadRejected { circuit: "a".into(), max_concurrent: 2 });
    }

    #[test]
    fn payload_carries_at_least_circuit_and_timing() {
        let opened = BreakerEvent::Opened { circuit: "svc".into(), failure_count: Some(5) };
        let payload = opened.payload();
        assert_eq!(payload["circuit"], "svc");
        assert_eq!(payload["failure_count"], 5);
    }

    #[test]
    fn storage_event_payload_carries_backend_fields() {
        let event = BreakerEvent::StorageFallback {
            circuit: "svc".into(),
            backend: "cache".into(),
            error_class: "timeout".into(),
            next_backend: Some("db".into()),
        };
        let payload = event.payload();
        assert_eq!(payload["backend"], "cache");
        assert_eq!(payload["error_class"], "timeout");
        assert_eq!(payload["next_backend"], "db");
    }
}
