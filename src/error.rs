//! Public error taxonomy surfaced to callers.

use thiserror::Error;

/// Errors a wrapped operation, a storage backend, or a configuration step can
/// surface to the caller.
///
/// One variant per failure kind, per §6/§7: admission rejection, guard
/// rejection, operational failure, and configuration/storage faults are kept
/// distinct so callers can match on the reason a call did not complete.
#[derive(Debug, Error)]
pub enum CircuitError {
    /// The circuit is `Open` and no fallback was configured (or the fallback
    /// itself raised).
    #[error("circuit '{name}' is open")]
    Open {
        /// Name of the circuit that rejected the call.
        name: String,
    },

    /// The bulkhead has no free permits. Never counted as a circuit failure.
    #[error("circuit '{name}' bulkhead exhausted (max_concurrent={max_concurrent})")]
    BulkheadFull {
        /// Name of the circuit whose bulkhead rejected the call.
        name: String,
        /// Configured bulkhead capacity.
        max_concurrent: u32,
    },

    /// A cooperative deadline elapsed before the operation completed.
    #[error("circuit '{name}' timed out after {deadline_ms}ms")]
    Timeout {
        /// Name of the circuit whose operation timed out.
        name: String,
        /// Configured deadline in milliseconds.
        deadline_ms: u64,
    },

    /// A coordinated state transition (recovery, manual reset) was denied
    /// because one or more upstream dependencies are `Open`.
    #[error("circuit '{name}' dependency guard denied: unmet={unmet:?}")]
    DependencyUnmet {
        /// Name of the circuit whose guard was denied.
        name: String,
        /// Names of dependencies currently `Open`.
        unmet: Vec<String>,
    },

    /// An invalid configuration value was detected when building a circuit.
    #[error("invalid circuit configuration: {message}")]
    Configuration {
        /// Human-readable description of what was invalid.
        message: String,
    },

    /// The operation itself raised a tracked error.
    #[error("operation failed: {source}")]
    Operation {
        /// The underlying error from the wrapped operation.
        #[source]
        source: anyhow::Error,
    },

    /// A storage backend failed to record or read an event, including a
    /// `FallbackChain` (§4.6) that exhausted every layer without a success —
    /// §4.6 step 6 names this "raise `StorageError`" explicitly.
    #[error("storage error: {message}")]
    Storage {
        /// Human-readable description of the storage fault, including (for a
        /// chain exhaustion) the backends that were attempted, in order.
        message: String,
    },

    /// A storage backend exceeded its per-operation time budget. Raised by a
    /// `FallbackChain` (§4.6) when the *last* layer it tried before giving up
    /// was skipped for a timeout rather than a hard error.
    #[error("storage '{backend}' timed out after {elapsed_ms}ms")]
    StorageTimeout {
        /// Name/index of the backend that timed out.
        backend: String,
        /// How long the operation ran before the budget was exceeded.
        elapsed_ms: u64,
    },
}

impl CircuitError {
    /// True for the two admission-control kinds (`Open`, `BulkheadFull`) that
    /// must never be counted as circuit failures (§4.2 step 2, §7 kind 2).
    pub fn is_rejection(&self) -> bool {
        matches!(self, CircuitError::Open { .. } | CircuitError::BulkheadFull { .. })
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, CircuitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        let open = CircuitError::Open { name: "svc".into() };
        let bulkhead = CircuitError::BulkheadFull { name: "svc".into(), max_concurrent: 4 };
        let op = CircuitError::Operation { source: anyhow::anyhow!("boom") };

        assert!(open.is_rejection());
        assert!(bulkhead.is_rejection());
        assert!(!op.is_rejection());
    }

    #[test]
    fn display_messages_include_name() {
        let err = CircuitError::Open { name: "payments".into() };
        assert!(err.to_string().contains("payments"));
    }
}
