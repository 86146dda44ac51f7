//! Degraded-response values substituted in place of a rejected or tracked
//! failure (§4.2 step 6).
//!
//! A circuit's output type is only known at the call site (`Circuit::call::<T>`),
//! while `Config` is a single concrete, non-generic type shared by every
//! circuit regardless of what it returns. `Fallback` bridges the two with
//! `Any`-based type erasure, the same trick `serde_json::Value` and friends
//! use to carry a dynamically-typed payload through a statically-typed API.

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

type AnyValue = Box<dyn Any + Send + Sync>;

/// A substitute result to hand back to the caller instead of propagating a
/// rejection or tracked failure.
#[derive(Clone)]
pub enum Fallback {
    /// Always produce the same value (cloned fresh on every use).
    Scalar(Arc<dyn Fn() -> AnyValue + Send + Sync>),
    /// Compute a value from the triggering error. Fallible: an `Err` here is
    /// a genuine candidate failure (§4.2: "an exception from it propagates"),
    /// distinct from the candidate simply producing the wrong type for the
    /// caller's expected `T`.
    Callable(Arc<dyn Fn(&anyhow::Error) -> anyhow::Result<AnyValue> + Send + Sync>),
    /// Try each candidate in order; the first non-raising, type-matching
    /// result wins. If every candidate either raises or produces the wrong
    /// type, and at least one raised, the last-raised error propagates
    /// (spec.md: "the first non-raising result wins; if all raise, the last
    /// exception propagates").
    Ordered(Arc<Vec<Fallback>>),
    /// Evaluate every candidate concurrently and use whichever produces a
    /// matching type first; unlike `Ordered` this does not imply a
    /// preference order between same-typed candidates. Every candidate is
    /// spawned on its own task so a fast candidate returns without waiting
    /// on a slow one; candidates still in flight when a winner is found are
    /// left running to completion and their results discarded, the same
    /// fire-and-forget shape `hedge.rs` uses for staggered attempts.
    Parallel(Arc<Vec<Fallback>>),
}

/// The outcome of resolving a [`Fallback`] against a target type `T`.
pub(crate) enum Resolution<T> {
    /// A candidate produced a `T` without raising.
    Value(T),
    /// Every candidate either raised or produced a value of some other type;
    /// `error` is the last one seen, if any candidate raised at all.
    Failed(Option<anyhow::Error>),
}

impl Fallback {
    /// A fallback that always returns a clone of `value`.
    pub fn scalar<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Fallback::Scalar(Arc::new(move || Box::new(value.clone()) as AnyValue))
    }

    /// A fallback computed from the error that triggered it. `f` may itself
    /// fail; that failure is a genuine candidate failure, not a type
    /// mismatch, and participates in `Ordered`/`Parallel`'s "last exception
    /// propagates" accounting.
    pub fn callable<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&anyhow::Error) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Fallback::Callable(Arc::new(move |err| f(err).map(|value| Box::new(value) as AnyValue)))
    }

    /// Try each fallback in `chain`, in order.
    pub fn ordered(chain: impl IntoIterator<Item = Fallback>) -> Self {
        Fallback::Ordered(Arc::new(chain.into_iter().collect()))
    }

    /// Try each fallback in `options`, taking the first type-compatible result.
    pub fn parallel(options: impl IntoIterator<Item = Fallback>) -> Self {
        Fallback::Parallel(Arc::new(options.into_iter().collect()))
    }

    /// Resolve this fallback against `error`, producing a `T` if the
    /// configured fallback (or one of its candidates) produces that type
    /// without raising. On [`Resolution::Failed`], callers distinguish "no
    /// candidate in this chain even targets `T`" (inner `None`) from "one or
    /// more candidates targeting `T` raised" (inner `Some`, the last such
    /// error) — only the latter should be propagated to the caller in place
    /// of the original triggering error.
    pub(crate) fn resolve<'a, T: Send + Sync + 'static>(&'a self, error: &'a anyhow::Error) -> BoxFuture<'a, Resolution<T>> {
        match self {
            Fallback::Scalar(f) => {
                let resolution = match f().downcast::<T>() {
                    Ok(value) => Resolution::Value(*value),
                    Err(_) => Resolution::Failed(None),
                };
                Box::pin(async move { resolution })
            }
            Fallback::Callable(f) => {
                let resolution = match f(error) {
                    Ok(any) => match any.downcast::<T>() {
                        Ok(value) => Resolution::Value(*value),
                        Err(_) => Resolution::Failed(None),
                    },
                    Err(err) => Resolution::Failed(Some(err)),
                };
                Box::pin(async move { resolution })
            }
            Fallback::Ordered(chain) => Box::pin(async move {
                let mut last_error = None;
                for candidate in chain.iter() {
                    match candidate.resolve::<T>(error).await {
                        Resolution::Value(value) => return Resolution::Value(value),
                        Resolution::Failed(Some(err)) => last_error = Some(err),
                        Resolution::Failed(None) => {}
                    }
                }
                Resolution::Failed(last_error)
            }),
            Fallback::Parallel(chain) => Box::pin(resolve_parallel(chain.clone(), error)),
        }
    }
}

/// Race every candidate in `chain` concurrently, taking the first
/// [`Resolution::Value`] to arrive. Losers are never cancelled: each is
/// spawned on its own task and simply left to finish, matching
/// `hedge::hedged_call`'s treatment of staggered attempts. When every
/// candidate fails, the reported error is the one from the
/// highest-indexed (last, chain order) failing candidate, not whichever
/// happened to finish last — concurrent completion order isn't
/// deterministic, but the chain's declared order is.
async fn resolve_parallel<T: Send + Sync + 'static>(chain: Arc<Vec<Fallback>>, error: &anyhow::Error) -> Resolution<T> {
    if chain.is_empty() {
        return Resolution::Failed(None);
    }

    let error_message = error.to_string();
    let (tx, mut rx) = mpsc::channel(chain.len());
    for (index, candidate) in chain.iter().cloned().enumerate() {
        let tx = tx.clone();
        let error_message = error_message.clone();
        tokio::spawn(async move {
            let owned_error = anyhow::anyhow!(error_message);
            let resolution = candidate.resolve::<T>(&owned_error).await;
            let _ = tx.send((index, resolution)).await;
        });
    }
    drop(tx);

    let mut last_error: Option<(usize, anyhow::Error)> = None;
    let mut remaining = chain.len();
    while remaining > 0 {
        match rx.recv().await {
            Some((_, Resolution::Value(value))) => return Resolution::Value(value),
            Some((index, Resolution::Failed(Some(err)))) => {
                remaining -= 1;
                let is_later = match &last_error {
                    Some((seen, _)) => index >= *seen,
                    None => true,
                };
                if is_later {
                    last_error = Some((index, err));
                }
            }
            Some((_, Resolution::Failed(None))) => remaining -= 1,
            None => break,
        }
    }
    Resolution::Failed(last_error.map(|(_, err)| err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok<T>(value: T) -> anyhow::Result<T> {
        Ok(value)
    }

    #[tokio::test]
    async fn scalar_fallback_always_returns_clone() {
        let fallback = Fallback::scalar(42_i32);
        let err = anyhow::anyhow!("boom");
        assert!(matches!(fallback.resolve::<i32>(&err).await, Resolution::Value(42)));
        assert!(matches!(fallback.resolve::<i32>(&err).await, Resolution::Value(42)));
    }

    #[tokio::test]
    async fn callable_fallback_sees_the_error() {
        let fallback = Fallback::callable(|err: &anyhow::Error| ok(err.to_string()));
        let err = anyhow::anyhow!("downstream unavailable");
        match fallback.resolve::<String>(&err).await {
            Resolution::Value(v) => assert_eq!(v, "downstream unavailable"),
            Resolution::Failed(_) => panic!("expected a value"),
        }
    }

    #[tokio::test]
    async fn callable_fallback_failure_is_not_a_type_mismatch() {
        let fallback = Fallback::callable(|_err: &anyhow::Error| -> anyhow::Result<String> {
            Err(anyhow::anyhow!("fallback itself failed"))
        });
        let err = anyhow::anyhow!("boom");
        match fallback.resolve::<String>(&err).await {
            Resolution::Failed(Some(e)) => assert_eq!(e.to_string(), "fallback itself failed"),
            other => panic!("expected a propagated fallback error, got a value or no error: {}", matches!(other, Resolution::Value(_))),
        }
    }

    #[tokio::test]
    async fn ordered_skips_type_mismatched_candidates() {
        let fallback = Fallback::ordered([Fallback::scalar(7_i64), Fallback::scalar("cached".to_string())]);
        let err = anyhow::anyhow!("boom");
        match fallback.resolve::<String>(&err).await {
            Resolution::Value(v) => assert_eq!(v, "cached"),
            Resolution::Failed(_) => panic!("expected a value"),
        }
    }

    #[tokio::test]
    async fn ordered_falls_through_a_raising_candidate_to_the_next() {
        let first = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> { Err(anyhow::anyhow!("cache miss")) });
        let second = Fallback::scalar("disk".to_string());
        let fallback = Fallback::ordered([first, second]);
        let err = anyhow::anyhow!("boom");
        match fallback.resolve::<String>(&err).await {
            Resolution::Value(v) => assert_eq!(v, "disk"),
            Resolution::Failed(_) => panic!("expected the second candidate's value"),
        }
    }

    #[tokio::test]
    async fn ordered_propagates_the_last_raised_error_when_every_candidate_fails() {
        let first = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> { Err(anyhow::anyhow!("first failed")) });
        let second = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> { Err(anyhow::anyhow!("second failed")) });
        let fallback = Fallback::ordered([first, second]);
        let err = anyhow::anyhow!("boom");
        match fallback.resolve::<String>(&err).await {
            Resolution::Failed(Some(e)) => assert_eq!(e.to_string(), "second failed"),
            other => panic!("expected the last error to propagate, got a value or no error: {}", matches!(other, Resolution::Value(_))),
        }
    }

    #[tokio::test]
    async fn parallel_propagates_the_last_raised_error_when_every_candidate_fails() {
        let first = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> { Err(anyhow::anyhow!("cache failed")) });
        let second = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> { Err(anyhow::anyhow!("db failed")) });
        let fallback = Fallback::parallel([first, second]);
        let err = anyhow::anyhow!("boom");
        match fallback.resolve::<String>(&err).await {
            Resolution::Failed(Some(e)) => assert_eq!(e.to_string(), "db failed"),
            other => panic!("expected the last error to propagate, got a value or no error: {}", matches!(other, Resolution::Value(_))),
        }
    }

    #[tokio::test]
    async fn mismatched_type_resolves_to_failed_with_no_error() {
        let fallback = Fallback::scalar(1_u32);
        let err = anyhow::anyhow!("boom");
        assert!(matches!(fallback.resolve::<String>(&err).await, Resolution::Failed(None)));
    }

    /// A fast candidate must not wait on a slow sibling: one candidate blocks
    /// its task for well longer than the test's own timeout budget while
    /// another resolves immediately, and the race returns the immediate
    /// value without waiting for the slow one to finish.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_returns_as_soon_as_the_fast_candidate_resolves() {
        let slow = Fallback::callable(|_: &anyhow::Error| -> anyhow::Result<String> {
            std::thread::sleep(std::time::Duration::from_secs(3600));
            Ok("slow".to_string())
        });
        let fast = Fallback::scalar("fast".to_string());
        let fallback = Fallback::parallel([slow, fast]);
        let err = anyhow::anyhow!("boom");

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), fallback.resolve::<String>(&err)).await.expect(
            "parallel race should have returned as soon as the fast candidate resolved, \
             without waiting for the slow candidate",
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        match result {
            Resolution::Value(v) => assert_eq!(v, "fast"),
            Resolution::Failed(_) => panic!("expected the fast candidate's value"),
        }
    }
}
