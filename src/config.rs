//! Circuit configuration and the fluent builder (§6).

use crate::classifier::{DefaultClassifier, FailureClassifier};
use crate::error::{CircuitError, Result};
use crate::event::EventSink;
use crate::fallback::Fallback;
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How the trip condition is evaluated (§4.2 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TripMode {
    /// Trip once `failure_count(window) >= failure_threshold`.
    Count {
        /// Consecutive/windowed failure count that trips the circuit.
        failure_threshold: u32,
    },
    /// Trip once `total >= minimum_calls` and `failures/total >= failure_rate`.
    Rate {
        /// Minimum sample size before the rate is evaluated.
        minimum_calls: u32,
        /// Failure ratio (0.0-1.0) that trips the circuit.
        failure_rate: f64,
    },
}

impl Default for TripMode {
    fn default() -> Self {
        TripMode::Count { failure_threshold: 5 }
    }
}

/// Hedged-execution parameters (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Whether hedging is enabled at all.
    pub enabled: bool,
    /// Delay between staggered attempts.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    /// Maximum number of attempts (including the first).
    pub max_requests: u32,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_millis(50),
            max_requests: 1,
        }
    }
}

/// Immutable circuit configuration (§6 table). Built once via [`CircuitBuilder`]
/// and never mutated after the circuit is constructed.
#[derive(Clone)]
pub struct Config {
    /// Circuit identity, used for storage keys and registry lookup.
    pub name: String,
    /// Sliding window, in seconds, used for count/rate trip evaluation.
    pub failure_window_seconds: u64,
    /// Count-mode or rate-mode trip condition.
    pub trip_mode: TripMode,
    /// Half-open successes required to close.
    pub success_threshold: u32,
    /// Half-open admission cap (concurrent trial calls).
    pub half_open_calls: u32,
    /// Open -> HalfOpen delay, before jitter.
    pub reset_timeout: Duration,
    /// Multiplicative jitter bound in `[0, 1]` applied to `reset_timeout`.
    pub reset_timeout_jitter: f64,
    /// Cooperative deadline applied via `tokio::time::timeout`, if any.
    pub timeout: Option<Duration>,
    /// Bulkhead capacity; `None` disables admission limiting.
    pub max_concurrent: Option<u32>,
    /// Which errors count as tracked failures.
    pub failure_classifier: Arc<dyn FailureClassifier>,
    /// Fallback behavior on rejection or tracked failure.
    pub fallback: Option<Fallback>,
    /// Storage backend. Defaults to `BucketMemoryStorage` per §4.5.
    pub storage: Arc<dyn StorageBackend>,
    /// Hedged-execution parameters.
    pub hedged: HedgeConfig,
    /// Downstream cascade target names (§4.9).
    pub cascades_to: Vec<String>,
    /// Upstream dependency names (§4.8).
    pub dependent_circuits: Vec<String>,
    /// Sink for the observable event vocabulary (§6).
    pub event_sink: Arc<dyn EventSink>,
    /// Callbacks (§4.1, §6).
    pub callbacks: Callbacks,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("failure_window_seconds", &self.failure_window_seconds)
            .field("trip_mode", &self.trip_mode)
            .field("success_threshold", &self.success_threshold)
            .field("half_open_calls", &self.half_open_calls)
            .field("reset_timeout", &self.reset_timeout)
            .field("reset_timeout_jitter", &self.reset_timeout_jitter)
            .field("timeout", &self.timeout)
            .field("max_concurrent", &self.max_concurrent)
            .field("hedged", &self.hedged)
            .field("cascades_to", &self.cascades_to)
            .field("dependent_circuits", &self.dependent_circuits)
            .finish_non_exhaustive()
    }
}

/// Callback hooks fired after a transition or outcome commits (§4.1/§6).
/// Exceptions/panics from callbacks are caught and logged; they never
/// propagate to the caller or block the transition (§4.1).
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Fired on entry to `Open`.
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired on entry to `Closed`.
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired on entry to `HalfOpen`.
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired when a call is rejected (Open or bulkhead-full).
    pub on_reject: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired on a successful call.
    pub on_success: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired on a tracked-failure call.
    pub on_failure: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired exactly once per transition-into-`Open` that cascades, with the
    /// list of downstream names affected (§4.9).
    pub emergency_protocol: Option<Arc<dyn Fn(&str, &[String]) + Send + Sync>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Invoke a callback, catching panics so user code can never bring down a
/// transition (§4.1: "Callback exceptions are caught and logged; they must
/// never prevent the transition nor leak to the caller").
pub(crate) fn run_callback(name: &str, label: &'static str, f: &Option<Arc<dyn Fn(&str) + Send + Sync>>) {
    if let Some(f) = f {
        if let Err(_panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(name))) {
            tracing::error!(circuit = %name, callback = label, "callback panicked; transition already committed");
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Fluent builder for [`Config`], grounded on the `breaker_machines` native
/// extension's `CircuitBuilder`.
pub struct CircuitBuilder {
    name: String,
    failure_window_seconds: u64,
    trip_mode: TripMode,
    success_threshold: u32,
    half_open_calls: u32,
    reset_timeout: Duration,
    reset_timeout_jitter: f64,
    timeout: Option<Duration>,
    max_concurrent: Option<u32>,
    failure_classifier: Arc<dyn FailureClassifier>,
    fallback: Option<Fallback>,
    storage: Option<Arc<dyn StorageBackend>>,
    hedged: HedgeConfig,
    cascades_to: Vec<String>,
    dependent_circuits: Vec<String>,
    event_sink: Arc<dyn EventSink>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Start building a circuit with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_window_seconds: 60,
            trip_mode: TripMode::default(),
            success_threshold: 1,
            half_open_calls: 1,
            reset_timeout: Duration::from_secs(60),
            reset_timeout_jitter: 0.25,
            timeout: None,
            max_concurrent: None,
            failure_classifier: Arc::new(DefaultClassifier),
            fallback: None,
            storage: None,
            hedged: HedgeConfig::default(),
            cascades_to: Vec::new(),
            dependent_circuits: Vec::new(),
            event_sink: Arc::new(crate::event::TracingEventSink),
            callbacks: Callbacks::default(),
        }
    }

    /// Set the count-mode failure threshold (default 5).
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.trip_mode = TripMode::Count { failure_threshold: threshold };
        self
    }

    /// Switch to rate-mode: trip once `failures/total >= rate` after
    /// `minimum_calls` samples.
    pub fn failure_rate(mut self, rate: f64, minimum_calls: u32) -> Self {
        self.trip_mode = TripMode::Rate { minimum_calls, failure_rate: rate.clamp(0.0, 1.0) };
        self
    }

    /// Set the sliding window, in seconds, used for trip evaluation.
    pub fn failure_window_seconds(mut self, seconds: u64) -> Self {
        self.failure_window_seconds = seconds;
        self
    }

    /// Set how many consecutive half-open successes are required to close.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the half-open admission cap.
    pub fn half_open_calls(mut self, max_calls: u32) -> Self {
        self.half_open_calls = max_calls.max(1);
        self
    }

    /// Set the base Open -> HalfOpen delay.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the multiplicative jitter bound (clamped to `[0, 1]`).
    pub fn reset_timeout_jitter(mut self, jitter: f64) -> Self {
        self.reset_timeout_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set a cooperative deadline applied via `tokio::time::timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable bulkhead admission control with the given capacity.
    pub fn max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Set a custom failure classifier (which errors count as tracked failures).
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = classifier;
        self
    }

    /// Configure a fallback for rejections and tracked failures.
    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Use a custom storage backend instead of the default
    /// `BucketMemoryStorage`.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enable hedged execution.
    pub fn hedged(mut self, delay: Duration, max_requests: u32) -> Self {
        self.hedged = HedgeConfig { enabled: true, delay, max_requests: max_requests.max(1) };
        self
    }

    /// Declare downstream circuits that should force-open when this circuit
    /// opens (§4.9).
    pub fn cascades_to(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cascades_to = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare upstream circuits that gate this circuit's recovery (§4.8).
    pub fn depends_on(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependent_circuits = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the default tracing-only event sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Set the `on_open` callback.
    pub fn on_open<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set the `on_close` callback.
    pub fn on_close<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set the `on_half_open` callback.
    pub fn on_half_open<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Set the `on_reject` callback.
    pub fn on_reject<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_reject = Some(Arc::new(f));
        self
    }

    /// Set the `on_success` callback.
    pub fn on_success<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_success = Some(Arc::new(f));
        self
    }

    /// Set the `on_failure` callback.
    pub fn on_failure<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_failure = Some(Arc::new(f));
        self
    }

    /// Set the `emergency_protocol` callback fired once per cascading trip.
    pub fn emergency_protocol<F: Fn(&str, &[String]) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.callbacks.emergency_protocol = Some(Arc::new(f));
        self
    }

    /// Validate and finish building the configuration.
    pub fn build_config(self) -> Result<Config> {
        if self.name.trim().is_empty() {
            return Err(CircuitError::Configuration { message: "circuit name must not be empty".into() });
        }
        if let Some(0) = self.max_concurrent {
            return Err(CircuitError::Configuration { message: "max_concurrent must be nonzero".into() });
        }

        Ok(Config {
            name: self.name,
            failure_window_seconds: self.failure_window_seconds,
            trip_mode: self.trip_mode,
            success_threshold: self.success_threshold,
            half_open_calls: self.half_open_calls,
            reset_timeout: self.reset_timeout,
            reset_timeout_jitter: self.reset_timeout_jitter,
            timeout: self.timeout,
            max_concurrent: self.max_concurrent,
            failure_classifier: self.failure_classifier,
            fallback: self.fallback,
            storage: self.storage.unwrap_or_else(crate::storage::default_storage),
            hedged: self.hedged,
            cascades_to: self.cascades_to,
            dependent_circuits: self.dependent_circuits,
            event_sink: self.event_sink,
            callbacks: self.callbacks,
        })
    }
}
