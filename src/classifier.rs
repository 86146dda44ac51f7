//! Tracked-exception classification (§4.2 step 3, §6 `tracked_exceptions`).
//!
//! Grounded on the `breaker_machines` native extension's `classifier.rs`
//! module of the same name and shape.

use std::fmt;
use std::time::Duration;

/// Context handed to a [`FailureClassifier`] when the wrapped operation
/// returns an error.
pub struct FailureContext<'a> {
    /// The error returned by the operation.
    pub error: &'a anyhow::Error,
    /// How long the operation ran before failing.
    pub duration: Duration,
}

/// Decides whether a given error should count toward opening the circuit.
///
/// Errors outside the tracked set still propagate to the caller (§4.2 step 3)
/// but do not mark the circuit as failing and do not consume a bulkhead
/// failure slot.
pub trait FailureClassifier: Send + Sync {
    /// Returns `true` if `ctx.error` should be treated as a tracked failure.
    fn is_tracked(&self, ctx: &FailureContext<'_>) -> bool;
}

impl fmt::Debug for dyn FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<FailureClassifier>")
    }
}

/// Default classifier: every error is tracked (§6 `tracked_exceptions`
/// default: all).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn is_tracked(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier driven by an arbitrary predicate, for callers who want to
/// ignore "expected" errors (e.g. client-side validation failures) while
/// still tripping on everything else.
pub struct PredicateClassifier {
    predicate: Box<dyn Fn(&FailureContext<'_>) -> bool + Send + Sync>,
}

impl PredicateClassifier {
    /// Build a classifier from a predicate function.
    pub fn new(predicate: impl Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self { predicate: Box::new(predicate) }
    }
}

impl FailureClassifier for PredicateClassifier {
    fn is_tracked(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classifier_tracks_everything() {
        let err = anyhow::anyhow!("boom");
        let ctx = FailureContext { error: &err, duration: Duration::from_millis(5) };
        assert!(DefaultClassifier.is_tracked(&ctx));
    }

    #[test]
    fn predicate_classifier_filters_by_duration() {
        let classifier = PredicateClassifier::new(|ctx| ctx.duration > Duration::from_secs(1));
        let err = anyhow::anyhow!("slow");
        let slow_ctx = FailureContext { error: &err, duration: Duration::from_secs(2) };
        let fast_ctx = FailureContext { error: &err, duration: Duration::from_millis(10) };

        assert!(classifier.is_tracked(&slow_ctx));
        assert!(!classifier.is_tracked(&fast_ctx));
    }
}
