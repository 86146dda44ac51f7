//! The circuit breaker itself: admission control, execution, accounting,
//! classification, and fallback (§4.2).

use crate::bulkhead::Bulkhead;
use crate::classifier::FailureContext;
use crate::clock::{Clock, RealClock};
use crate::config::{run_callback, Config, TripMode};
use crate::error::{CircuitError, Result};
use crate::event::{BreakerEvent, CircuitState};
use crate::registry;
use crate::state::{jittered_deadline, StateMachine};
use crate::storage::{PersistedState, StatusRecord};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single fault-isolation boundary: state machine, sliding-window
/// accounting, optional bulkhead, optional fallback, optional cascade and
/// dependency wiring, all driven off one [`Config`].
pub struct Circuit {
    config: Config,
    clock: Arc<dyn Clock>,
    state: StateMachine,
    bulkhead: Option<Bulkhead>,
}

/// The outcome of a successful [`Circuit::admit`]: the pre-call state (used
/// to decide half-open bookkeeping once the attempt finishes) and, if this
/// circuit has a bulkhead, the held permit. Dropping this releases the
/// permit.
struct Admission {
    state: CircuitState,
    _permit: Option<crate::bulkhead::BulkheadGuard>,
}

impl Circuit {
    /// Build and register a circuit from a validated configuration. The
    /// circuit is registered under its name in the process-global registry
    /// (§4.7) so `cascades_to` / `depends_on` can resolve it by name.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_clock(config, Arc::new(RealClock))
    }

    pub(crate) fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        let bulkhead = config.max_concurrent.map(Bulkhead::new);
        let circuit = Arc::new(Self { config, clock, state: StateMachine::new(), bulkhead });
        registry::register(circuit.clone());
        circuit
    }

    /// The circuit's name (also its storage key and registry key).
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The circuit's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current externally-observable state, first advancing Open -> HalfOpen
    /// if the jittered reset deadline has elapsed.
    pub fn state(&self) -> CircuitState {
        self.poll_state()
    }

    /// Poll the state machine, advancing Open -> HalfOpen if due, and fire
    /// `on_half_open` / the `HalfOpened` event exactly once if this call is
    /// the one that performed that advance (§4.1). Shared by every call site
    /// that reads current state, so the entry side effect fires regardless
    /// of whether the transition was observed by [`Self::state`], admission,
    /// or a rejection path.
    fn poll_state(&self) -> CircuitState {
        let dependencies_ok = self.unmet_dependencies().is_empty();
        let (state, entered_half_open) = self.state.poll_transition_announced(self.clock.now(), dependencies_ok);
        if entered_half_open {
            self.config.event_sink.emit(BreakerEvent::HalfOpened { circuit: self.name().to_string() });
            run_callback(self.name(), "on_half_open", &self.config.callbacks.on_half_open);
            self.spawn_persist_status(CircuitState::HalfOpen);
        }
        state
    }

    /// Current in-flight call count if this circuit has a bulkhead, `None`
    /// otherwise.
    pub fn in_flight(&self) -> Option<u32> {
        self.bulkhead.as_ref().map(Bulkhead::in_flight)
    }

    /// Force the circuit open immediately, bypassing its trip condition.
    /// Cascades to downstream circuits exactly as a natural trip would.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let deadline = jittered_deadline(now, self.config.reset_timeout, self.config.reset_timeout_jitter);
        if self.state.force_open(now, deadline) {
            self.emit_opened(None);
            self.cascade();
            self.spawn_persist_status(CircuitState::Open);
        }
    }

    /// Force the circuit closed immediately. In-flight calls admitted before
    /// the reset are not cancelled; their outcome is still recorded when they
    /// complete.
    ///
    /// Guarded exactly like `attempt_recovery` (§4.1, §4.8): denied with
    /// [`CircuitError::DependencyUnmet`] if any declared upstream dependency
    /// is currently `Open`. Use [`Self::hard_reset`] to bypass this guard.
    pub fn reset(&self) -> Result<()> {
        let unmet = self.unmet_dependencies();
        if !unmet.is_empty() {
            return Err(CircuitError::DependencyUnmet { name: self.name().to_string(), unmet });
        }
        if self.state.force_close() {
            self.config.event_sink.emit(BreakerEvent::Closed { circuit: self.name().to_string() });
            run_callback(self.name(), "on_close", &self.config.callbacks.on_close);
            self.spawn_persist_status(CircuitState::Closed);
        }
        Ok(())
    }

    /// Unconditionally reset to `Closed` and clear this circuit's recorded
    /// events (§4.1 `hard_reset`). Never denied by a dependency guard, and
    /// idempotent: calling it twice in a row is equivalent to calling it
    /// once. Does not cancel in-flight calls admitted before the reset;
    /// their outcome is still recorded when they complete (§9 Open Question).
    pub async fn hard_reset(&self) {
        self.state.hard_reset();
        if let Err(error) = self.config.storage.clear(self.name()).await {
            tracing::warn!(circuit = %self.name(), %error, "hard_reset: storage clear failed");
        }
        self.config.event_sink.emit(BreakerEvent::Closed { circuit: self.name().to_string() });
        run_callback(self.name(), "on_close", &self.config.callbacks.on_close);
        self.persist_status(CircuitState::Closed).await;
    }

    /// Persisted-status form of `state` (§3/§6: `closed | open | half_open`).
    fn persisted_state(state: CircuitState) -> PersistedState {
        match state {
            CircuitState::Closed => PersistedState::Closed,
            CircuitState::Open => PersistedState::Open,
            CircuitState::HalfOpen => PersistedState::HalfOpen,
        }
    }

    /// Write this circuit's `{state, opened_at?}` to storage (§3 Storage
    /// status record, §6 persisted status layout), so a shared backend can
    /// reconstitute the circuit's status across processes. A storage fault
    /// here is logged, never propagated (§7 kind 5) — the in-process state
    /// machine, not storage, is this circuit's source of truth.
    async fn persist_status(&self, state: CircuitState) {
        let opened_at = match state {
            CircuitState::Closed => None,
            CircuitState::Open | CircuitState::HalfOpen => Some(self.clock.wall_now_secs()),
        };
        let record = StatusRecord { state: Self::persisted_state(state), opened_at };
        if let Err(error) = self.config.storage.set_status(self.name(), record).await {
            tracing::warn!(circuit = %self.name(), %error, "failed to persist circuit status");
        }
    }

    /// Fire-and-forget [`Self::persist_status`] from a synchronous call site
    /// (`force_open`, `reset`, the `poll_state` half-open advance): these are
    /// public, non-async entry points, so persistence runs on a spawned task
    /// rather than blocking the caller on storage I/O. A no-op outside a
    /// Tokio runtime (e.g. a plain `#[test]` driving `StateMachine` directly
    /// has none) rather than panicking.
    fn spawn_persist_status(&self, state: CircuitState) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
        let storage = self.config.storage.clone();
        let name = self.name().to_string();
        let opened_at = match state {
            CircuitState::Closed => None,
            CircuitState::Open | CircuitState::HalfOpen => Some(self.clock.wall_now_secs()),
        };
        let record = StatusRecord { state: Self::persisted_state(state), opened_at };
        handle.spawn(async move {
            if let Err(error) = storage.set_status(&name, record).await {
                tracing::warn!(circuit = %name, %error, "failed to persist circuit status");
            }
        });
    }

    fn emit_opened(&self, failure_count: Option<u64>) {
        self.config.event_sink.emit(BreakerEvent::Opened { circuit: self.name().to_string(), failure_count });
        run_callback(self.name(), "on_open", &self.config.callbacks.on_open);
    }

    fn cascade(&self) {
        for downstream in &self.config.cascades_to {
            if let Some(circuit) = registry::lookup(downstream) {
                circuit.force_open();
            }
        }
        if !self.config.cascades_to.is_empty() {
            if let Some(protocol) = &self.config.callbacks.emergency_protocol {
                let name = self.name().to_string();
                let targets = self.config.cascades_to.clone();
                if std::panic::catch_unwind(AssertUnwindSafe(|| protocol(&name, &targets))).is_err() {
                    tracing::error!(circuit = %name, "emergency_protocol callback panicked");
                }
            }
        }
    }

    /// Upstream dependency names currently `Open`, empty if every dependency
    /// is healthy (or none are declared).
    fn unmet_dependencies(&self) -> Vec<String> {
        self.config
            .dependent_circuits
            .iter()
            .filter(|dep| registry::lookup(dep).map(|c| c.state() == CircuitState::Open).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Run `operation` subject to dependency guards, admission control,
    /// the optional cooperative timeout, failure classification, accounting,
    /// and fallback.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Send + Sync + 'static,
    {
        // A fresh correlation id per call, threaded through the whole admit
        // -> execute -> classify span so admission and outcome log lines for
        // the same call can be joined, the way
        // `riptide-events::adapters::event_bus_adapter` stamps a
        // `uuid::Uuid::new_v4()` onto each emitted event. `Instrument`
        // (rather than `Span::enter`) because this span must survive
        // `.await` points.
        use tracing::Instrument;
        let call_id = uuid::Uuid::new_v4();
        let span = tracing::debug_span!("circuit_call", circuit = %self.name(), %call_id);

        async move {
            let admission = match self.admit().await {
                Ok(admission) => admission,
                Err(error) => return self.reject(error).await,
            };
            self.run_and_classify(admission, operation()).await
        }
        .instrument(span)
        .await
    }

    /// Like [`Self::call`], but runs staggered-parallel attempts per the
    /// circuit's `hedged` configuration (§4.3): attempt #1 starts
    /// immediately, a fresh attempt starts every `hedged.delay` thereafter
    /// (up to `hedged.max_requests`) as long as nothing has yet succeeded,
    /// and the first successful completion wins. Exactly one outcome is
    /// recorded against the circuit regardless of how many attempts ran. If
    /// hedging is not enabled in configuration, this degrades to a single
    /// call of `make_attempt`.
    pub async fn call_hedged<F, Fut, T>(&self, make_attempt: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        if !self.config.hedged.enabled {
            return self.call(make_attempt).await;
        }

        use tracing::Instrument;
        let call_id = uuid::Uuid::new_v4();
        let span = tracing::debug_span!("circuit_call_hedged", circuit = %self.name(), %call_id);

        async move {
            let admission = match self.admit().await {
                Ok(admission) => admission,
                Err(error) => return self.reject(error).await,
            };
            let hedge_config = self.config.hedged;
            let attempt = crate::hedge::boxed_attempt(make_attempt);
            let fut = crate::hedge::hedged_call(&hedge_config, attempt);
            self.run_and_classify(admission, fut).await
        }
        .instrument(span)
        .await
    }

    /// State-check and bulkhead-acquire (§4.2 steps 1-2). The dependency
    /// guard (§4.8) is folded into [`Self::poll_state`]'s Open -> HalfOpen
    /// transition rather than checked again here: a circuit whose guard
    /// denies recovery simply stays `Open`, which this already rejects with
    /// the ordinary `CircuitError::Open` (and its fallback) below. A `Closed`
    /// circuit is never rejected merely because some unrelated dependency
    /// happens to be `Open` — only its own trip condition does that.
    /// Returns the admitted [`Admission`] (carrying the pre-call state and,
    /// if applicable, the held bulkhead permit) or the rejection reason.
    async fn admit(&self) -> std::result::Result<Admission, CircuitError> {
        let state = self.poll_state();
        match state {
            CircuitState::Open => return Err(CircuitError::Open { name: self.name().to_string() }),
            CircuitState::HalfOpen => {
                if !self.state.try_enter_half_open_trial(self.config.half_open_calls) {
                    return Err(CircuitError::Open { name: self.name().to_string() });
                }
            }
            CircuitState::Closed => {}
        }

        let permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    if state == CircuitState::HalfOpen {
                        self.state.leave_half_open_trial();
                    }
                    let max_concurrent = self.config.max_concurrent.unwrap_or_default();
                    self.config.event_sink.emit(BreakerEvent::BulkheadRejected {
                        circuit: self.name().to_string(),
                        max_concurrent,
                    });
                    return Err(CircuitError::BulkheadFull { name: self.name().to_string(), max_concurrent });
                }
            },
            None => None,
        };

        Ok(Admission { state, _permit: permit })
    }

    /// Run an already-invoked attempt future to completion under the
    /// configured cooperative timeout (§4.2 step 3), then classify and
    /// record its outcome (§4.2 step 4). Shared by [`Self::call`] and
    /// [`Self::call_hedged`] so both paths account exactly once per logical
    /// call regardless of how many underlying attempts ran.
    async fn run_and_classify<Fut, T>(&self, admission: Admission, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
        T: Send + Sync + 'static,
    {
        let state = admission.state;
        let started = Instant::now();
        let outcome = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(anyhow::anyhow!(CircuitError::Timeout {
                    name: self.name().to_string(),
                    deadline_ms: timeout.as_millis() as u64,
                })),
            },
            None => fut.await,
        };
        let duration = started.elapsed();

        if state == CircuitState::HalfOpen {
            self.state.leave_half_open_trial();
        }

        match outcome {
            Ok(value) => {
                self.on_success(state, duration).await;
                Ok(value)
            }
            Err(error) => self.on_failure(state, duration, error).await,
        }
    }

    async fn on_success(&self, state: CircuitState, duration: Duration) {
        let _ = self.config.storage.record_success(self.name(), duration).await;
        self.config.event_sink.emit(BreakerEvent::Success { circuit: self.name().to_string(), duration });
        run_callback(self.name(), "on_success", &self.config.callbacks.on_success);

        if state == CircuitState::HalfOpen && self.state.record_half_open_success(self.config.success_threshold) {
            self.config.event_sink.emit(BreakerEvent::Closed { circuit: self.name().to_string() });
            run_callback(self.name(), "on_close", &self.config.callbacks.on_close);
            self.persist_status(CircuitState::Closed).await;
        }
    }

    async fn on_failure<T: Send + Sync + 'static>(
        &self,
        state: CircuitState,
        duration: Duration,
        error: anyhow::Error,
    ) -> Result<T> {
        let ctx = FailureContext { error: &error, duration };
        if !self.config.failure_classifier.is_tracked(&ctx) {
            return Err(CircuitError::Operation { source: error });
        }

        let _ = self.config.storage.record_failure(self.name(), duration, Some(error.to_string())).await;
        self.config.event_sink.emit(BreakerEvent::Failure {
            circuit: self.name().to_string(),
            duration,
            error_class: error.to_string(),
        });
        run_callback(self.name(), "on_failure", &self.config.callbacks.on_failure);

        if state == CircuitState::HalfOpen {
            let now = self.clock.now();
            let deadline = jittered_deadline(now, self.config.reset_timeout, self.config.reset_timeout_jitter);
            self.state.record_half_open_failure(now, deadline);
            self.emit_opened(None);
            self.cascade();
            self.persist_status(CircuitState::Open).await;
        } else if self.should_trip().await {
            let now = self.clock.now();
            let deadline = jittered_deadline(now, self.config.reset_timeout, self.config.reset_timeout_jitter);
            if self.state.force_open(now, deadline) {
                let failures = self.current_failure_count().await;
                self.emit_opened(Some(failures));
                self.cascade();
                self.persist_status(CircuitState::Open).await;
            }
        }

        if let Some(fallback) = &self.config.fallback {
            match fallback.resolve::<T>(&error).await {
                crate::fallback::Resolution::Value(value) => return Ok(value),
                crate::fallback::Resolution::Failed(Some(fallback_error)) => {
                    return Err(CircuitError::Operation { source: fallback_error });
                }
                crate::fallback::Resolution::Failed(None) => {}
            }
        }

        Err(CircuitError::Operation { source: error })
    }

    async fn current_failure_count(&self) -> u64 {
        self.config.storage.failure_count(self.name(), self.config.failure_window_seconds).await.unwrap_or(0)
    }

    async fn should_trip(&self) -> bool {
        match &self.config.trip_mode {
            TripMode::Count { failure_threshold } => self.current_failure_count().await >= *failure_threshold as u64,
            TripMode::Rate { minimum_calls, failure_rate } => {
                let failures = self.current_failure_count().await;
                let successes =
                    self.config.storage.success_count(self.name(), self.config.failure_window_seconds).await.unwrap_or(0);
                let total = failures + successes;
                if total < *minimum_calls as u64 {
                    return false;
                }
                (failures as f64) / (total as f64) >= *failure_rate
            }
        }
    }

    async fn reject<T: Send + Sync + 'static>(&self, error: CircuitError) -> Result<T> {
        let state = self.poll_state();
        self.config.event_sink.emit(BreakerEvent::Rejected { circuit: self.name().to_string(), state });
        run_callback(self.name(), "on_reject", &self.config.callbacks.on_reject);

        // §7: bulkhead rejection is a load-shedding signal, not a service
        // failure — the caller always sees `CircuitBulkheadError` even if a
        // fallback is configured. Only an Open-state rejection may resolve
        // through the fallback chain.
        let is_bulkhead_rejection = matches!(error, CircuitError::BulkheadFull { .. });
        if !is_bulkhead_rejection {
            if let Some(fallback) = &self.config.fallback {
                let wrapped = anyhow::anyhow!(error.to_string());
                match fallback.resolve::<T>(&wrapped).await {
                    crate::fallback::Resolution::Value(value) => return Ok(value),
                    crate::fallback::Resolution::Failed(Some(fallback_error)) => {
                        return Err(CircuitError::Operation { source: fallback_error });
                    }
                    crate::fallback::Resolution::Failed(None) => {}
                }
            }
        }
        Err(error)
    }
}
