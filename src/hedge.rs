//! Staggered-parallel ("hedged") execution: fire a second attempt after a
//! delay if the first hasn't finished, and take whichever finishes first
//! (§4.3).
//!
//! Grounded on `riptide-utils::timeout::manager`'s race-against-a-sleep
//! pattern, generalized from "one attempt vs. a deadline" to "N staggered
//! attempts vs. each other."

use crate::config::HedgeConfig;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;

/// Run up to `config.max_requests` staggered attempts of `make_attempt`,
/// spaced `config.delay` apart, returning the first successful result. If
/// every attempt fails, returns the error from whichever attempt finished
/// last (§9 resolved: last-seen-error-wins on total failure).
pub(crate) async fn hedged_call<F, T>(config: &HedgeConfig, make_attempt: F) -> anyhow::Result<T>
where
    F: Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    T: Send + 'static,
{
    let attempts_cap = config.max_requests.max(1);
    let (tx, mut rx) = mpsc::channel(attempts_cap as usize);

    // The returned `JoinHandle` is intentionally dropped rather than kept:
    // per §4.3/§5, cancellation of a losing attempt is advisory only, and
    // this crate never forcibly terminates in-flight work. A dropped handle
    // lets the spawned task run to completion on its own; its result (sent
    // into `tx`, which stays open for the task's lifetime) is simply never
    // read once this function has already returned.
    let spawn_attempt = |tx: mpsc::Sender<anyhow::Result<T>>| {
        let fut = make_attempt();
        tokio::spawn(async move {
            let _ = tx.send(fut.await).await;
        });
    };

    spawn_attempt(tx.clone());
    let mut launched = 1u32;
    let mut in_flight = 1u32;
    let mut last_error = None;

    // Race the next staggered launch against an already-arrived result, so
    // a fast first success returns immediately instead of waiting out every
    // remaining hedging delay (§4.3: "every hedging_delay ms thereafter, IF
    // no attempt has completed successfully, start attempt #k+1"). Checked
    // before every `recv`, since the original `tx` is held for the whole
    // function and never closes the channel on its own.
    loop {
        if in_flight == 0 && launched >= attempts_cap {
            break;
        }
        if launched < attempts_cap {
            tokio::select! {
                _ = tokio::time::sleep(config.delay) => {
                    spawn_attempt(tx.clone());
                    launched += 1;
                    in_flight += 1;
                }
                message = rx.recv() => {
                    match message {
                        Some(Ok(value)) => return Ok(value),
                        Some(Err(error)) => {
                            last_error = Some(error);
                            in_flight -= 1;
                        }
                        None => break,
                    }
                }
            }
        } else {
            match rx.recv().await {
                Some(Ok(value)) => return Ok(value),
                Some(Err(error)) => {
                    last_error = Some(error);
                    in_flight -= 1;
                }
                None => break,
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("hedged call produced no attempts")))
}

/// Build a boxed, cloneable attempt factory from an `Fn` closure returning a
/// future. Kept as a free function so callers at the `Circuit` call site
/// don't need to box their closures by hand.
pub(crate) fn boxed_attempt<F, Fut, T>(f: F) -> impl Fn() -> BoxFuture<'static, anyhow::Result<T>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    move || Box::pin(f())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn first_success_wins() {
        let config = HedgeConfig { enabled: true, delay: StdDuration::from_millis(5), max_requests: 3 };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = hedged_call(&config, boxed_attempt(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    tokio::time::sleep(StdDuration::from_millis(100)).await;
                    Ok(1)
                } else {
                    Ok(2)
                }
            }
        }))
        .await
        .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn all_failures_surfaces_last_error() {
        let config = HedgeConfig { enabled: true, delay: StdDuration::from_millis(1), max_requests: 2 };
        let err = hedged_call(&config, boxed_attempt(|| async { Err::<i32, _>(anyhow::anyhow!("nope")) }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn single_request_behaves_like_a_plain_call() {
        let config = HedgeConfig { enabled: true, delay: StdDuration::from_millis(50), max_requests: 1 };
        let result = hedged_call(&config, boxed_attempt(|| async { Ok::<_, anyhow::Error>("done") })).await.unwrap();
        assert_eq!(result, "done");
    }

    /// Staggered attempts are spaced exactly `delay` apart even when the
    /// first attempt never finishes, using paused virtual time rather than
    /// real sleeps so the assertion isn't flaky under load.
    #[tokio::test(start_paused = true)]
    async fn second_attempt_waits_the_full_delay_before_firing() {
        let config = HedgeConfig { enabled: true, delay: StdDuration::from_millis(100), max_requests: 2 };
        let launches = Arc::new(AtomicU32::new(0));
        let launches_clone = launches.clone();

        let call = tokio::spawn(async move {
            hedged_call(
                &config,
                boxed_attempt(move || {
                    let launches = launches_clone.clone();
                    async move {
                        launches.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<()>().await;
                        Ok::<_, anyhow::Error>(())
                    }
                }),
            )
            .await
        });

        tokio::time::advance(StdDuration::from_millis(50)).await;
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        tokio::time::advance(StdDuration::from_millis(51)).await;
        assert_eq!(launches.load(Ordering::SeqCst), 2);

        call.abort();
    }

    /// A fast first success must not wait out the remaining staggered
    /// delays: with `max_requests=3` and a `delay` long enough that neither
    /// backup attempt would ever fire before the test times out, the call
    /// still returns as soon as the (instant) first attempt completes.
    #[tokio::test(start_paused = true)]
    async fn fast_first_success_returns_without_waiting_for_remaining_delays() {
        let config = HedgeConfig { enabled: true, delay: StdDuration::from_secs(3600), max_requests: 3 };
        let result = hedged_call(&config, boxed_attempt(|| async { Ok::<_, anyhow::Error>("instant") })).await.unwrap();
        assert_eq!(result, "instant");
    }
}
