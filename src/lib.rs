//! # Breaker Machines
//!
//! Fault-isolation circuit breaker primitives: a per-circuit Closed/Open/
//! Half-Open state machine with jittered recovery timing, a bounded-memory
//! sliding-window event store, bulkhead admission control, hedged
//! (staggered-parallel) execution, dependency-aware cascading trips across a
//! named dependency graph, and layered fallback-chain storage.
//!
//! ## Quick start
//!
//! ```rust
//! use breaker_machines::{Circuit, CircuitBuilder};
//! use std::time::Duration;
//!
//! # async fn run() {
//! let circuit = Circuit::new(
//!     CircuitBuilder::new("payments.charge")
//!         .failure_threshold(5)
//!         .reset_timeout(Duration::from_secs(30))
//!         .max_concurrent(50)
//!         .build_config()
//!         .unwrap(),
//! );
//!
//! let result = circuit.call(|| async { Ok::<_, anyhow::Error>("charged") }).await;
//! # }
//! ```
//!
//! Circuits are looked up by name through the process-wide [`registry`]
//! rather than held as owning references, so `cascades_to` / `depends_on`
//! graphs and [`group::CircuitGroup`] membership can name each other freely
//! without reference cycles (§9 of the design notes). [`template`] layers
//! named, inheritable configuration fragments and instance- or
//! process-scoped dynamic circuit creation on top of the same builder.

pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod fallback;
pub mod group;
pub mod hedge;
pub mod registry;
pub mod state;
pub mod storage;
pub mod template;

pub use circuit::Circuit;
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, RealClock, TestClock};
pub use config::{Callbacks, CircuitBuilder, Config, HedgeConfig, TripMode};
pub use error::{CircuitError, Result};
pub use event::{BreakerEvent, CircuitState, Event, EventKind, EventSink, TracingEventSink};
pub use fallback::Fallback;
pub use group::CircuitGroup;
pub use registry::CircuitStats;
pub use storage::{
    BackendSpec, BucketMemoryStorage, FallbackChainStorage, MemoryStorage, NullStorage, PersistedState, StatusRecord,
    StorageBackend,
};
pub use template::{register_template, weak_callback, DynamicCircuits, Scope};

#[cfg(test)]
mod tests {
    use super::*;

    /// Smoke test that every module is wired into the crate root and the
    /// common happy path (build -> call -> observe) works end to end.
    #[tokio::test]
    async fn public_api_is_reachable_from_the_crate_root() {
        registry::clear();
        let circuit = Circuit::new(CircuitBuilder::new("lib-smoke-test").failure_threshold(3).build_config().unwrap());
        let result = circuit.call(|| async { Ok::<_, anyhow::Error>(1) }).await.unwrap();
        assert_eq!(result, 1);
        assert_eq!(circuit.state(), CircuitState::Closed);

        let group = CircuitGroup::new("lib-smoke-group");
        let member = group.circuit("member", Vec::<String>::new(), |b| b).unwrap();
        assert_eq!(member.name(), "lib-smoke-group.member");

        let dynamic = DynamicCircuits::new();
        let dyn_circuit = dynamic.dynamic_circuit("lib-smoke-dynamic", None, Scope::Local, |b| b).unwrap();
        assert_eq!(dyn_circuit.state(), CircuitState::Closed);
    }
}
