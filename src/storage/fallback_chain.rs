//! Layered multi-backend storage with per-backend health tracking (§4.6).
//!
//! A `FallbackChainStorage` wraps an ordered list of backends — typically
//! "fast but fragile" first (a bucketed in-process cache) and "slow but
//! durable" last. Each backend carries its own miniature breaker: after
//! `failure_threshold` consecutive failures or timeouts it is parked for
//! `cooldown` before being retried, and calls skip straight past it to the
//! next backend in the meantime.

use super::{StatusRecord, StorageBackend};
use crate::event::{BreakerEvent, Event, EventSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One layer of a [`FallbackChainStorage`], with its own timeout and
/// failure-tolerance budget.
pub struct BackendSpec {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) timeout: Duration,
    pub(crate) failure_threshold: u32,
    pub(crate) cooldown: Duration,
}

impl BackendSpec {
    /// A new layer named `name`, wrapping `backend` with sensible defaults:
    /// a 200ms per-call timeout, a 3-failure trip threshold, and a 30s
    /// cooldown before retrying a parked backend.
    pub fn new(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            timeout: Duration::from_millis(200),
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }

    /// Override the per-call timeout for this layer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the number of consecutive failures before this layer is
    /// parked.
    pub fn failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    /// Override how long a parked layer is skipped before being retried.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

struct Health {
    consecutive_failures: u32,
    unhealthy_until: Option<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Self { consecutive_failures: 0, unhealthy_until: None }
    }
}

struct Layer {
    spec: BackendSpec,
    health: Mutex<Health>,
}

/// Storage backend that fans calls out across an ordered chain of backends,
/// skipping parked layers and falling back on timeout or error.
pub struct FallbackChainStorage {
    layers: Vec<Layer>,
    event_sink: Arc<dyn EventSink>,
}

impl FallbackChainStorage {
    /// Build a chain from an ordered list of layers, outermost (tried first)
    /// to innermost (tried last).
    pub fn new(backends: Vec<BackendSpec>, event_sink: Arc<dyn EventSink>) -> Self {
        let layers = backends.into_iter().map(|spec| Layer { spec, health: Mutex::new(Health::default()) }).collect();
        Self { layers, event_sink }
    }

    async fn is_parked(&self, layer: &Layer) -> bool {
        let health = layer.health.lock().await;
        match health.unhealthy_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    async fn record_success_health(&self, layer: &Layer) {
        let mut health = layer.health.lock().await;
        if health.consecutive_failures > 0 || health.unhealthy_until.is_some() {
            self.event_sink.emit(BreakerEvent::StorageBackendHealth { backend: layer.spec.name.clone(), unhealthy: false });
        }
        health.consecutive_failures = 0;
        health.unhealthy_until = None;
    }

    async fn record_failure_health(&self, layer: &Layer) {
        let mut health = layer.health.lock().await;
        health.consecutive_failures += 1;
        if health.consecutive_failures >= layer.spec.failure_threshold && health.unhealthy_until.is_none() {
            health.unhealthy_until = Some(Instant::now() + layer.spec.cooldown);
            self.event_sink.emit(BreakerEvent::StorageBackendHealth { backend: layer.spec.name.clone(), unhealthy: true });
        }
    }

    fn next_candidate_name(&self, from_index: usize) -> Option<String> {
        self.layers.get(from_index + 1..)?.first().map(|l| l.spec.name.clone())
    }

    /// Run `op` against each non-parked layer in order, falling back on
    /// timeout or error, until one succeeds or the chain is exhausted.
    ///
    /// On exhaustion (§4.6 step 6: "If all backends exhausted, raise
    /// `StorageError`"), the returned error reflects the *last* layer tried:
    /// [`crate::error::CircuitError::StorageTimeout`] if that layer was
    /// skipped for exceeding its time budget, [`crate::error::CircuitError::Storage`]
    /// (naming every attempted backend) otherwise — including the case where
    /// every layer was parked and none was attempted at all.
    async fn run<T, F, Fut>(&self, circuit: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempted = Vec::new();
        let mut last_timeout: Option<(String, u64)> = None;
        for (index, layer) in self.layers.iter().enumerate() {
            if self.is_parked(layer).await {
                continue;
            }
            attempted.push(layer.spec.name.clone());
            let started = Instant::now();
            let result = tokio::time::timeout(layer.spec.timeout, op(layer.spec.backend.clone())).await;
            match result {
                Ok(Ok(value)) => {
                    self.record_success_health(layer).await;
                    self.event_sink.emit(BreakerEvent::StorageOperation {
                        circuit: circuit.to_string(),
                        backend: layer.spec.name.clone(),
                        backend_index: index,
                        duration: started.elapsed(),
                    });
                    self.event_sink.emit(BreakerEvent::StorageChainOperation { success: true, attempted });
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    last_timeout = None;
                    self.record_failure_health(layer).await;
                    self.event_sink.emit(BreakerEvent::StorageFallback {
                        circuit: circuit.to_string(),
                        backend: layer.spec.name.clone(),
                        error_class: classify(&err),
                        next_backend: self.next_candidate_name(index),
                    });
                }
                Err(_elapsed) => {
                    last_timeout = Some((layer.spec.name.clone(), started.elapsed().as_millis() as u64));
                    self.record_failure_health(layer).await;
                    self.event_sink.emit(BreakerEvent::StorageFallback {
                        circuit: circuit.to_string(),
                        backend: layer.spec.name.clone(),
                        error_class: "timeout".to_string(),
                        next_backend: self.next_candidate_name(index),
                    });
                }
            }
        }
        self.event_sink.emit(BreakerEvent::StorageChainOperation { success: false, attempted: attempted.clone() });
        let error = match last_timeout {
            Some((backend, elapsed_ms)) => crate::error::CircuitError::StorageTimeout { backend, elapsed_ms },
            None => crate::error::CircuitError::Storage {
                message: format!("all fallback chain backends exhausted: attempted={attempted:?}"),
            },
        };
        Err(anyhow::anyhow!(error))
    }
}

fn classify(err: &anyhow::Error) -> String {
    err.to_string()
}

#[async_trait]
impl StorageBackend for FallbackChainStorage {
    async fn record_success(&self, name: &str, duration: Duration) -> anyhow::Result<()> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.record_success(&name, duration).await }
        })
        .await
    }

    async fn record_failure(
        &self,
        name: &str,
        duration: Duration,
        error_info: Option<String>,
    ) -> anyhow::Result<()> {
        self.run(name, |backend| {
            let name = name.to_string();
            let error_info = error_info.clone();
            async move { backend.record_failure(&name, duration, error_info).await }
        })
        .await
    }

    async fn success_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.success_count(&name, window_seconds).await }
        })
        .await
    }

    async fn failure_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.failure_count(&name, window_seconds).await }
        })
        .await
    }

    async fn get_status(&self, name: &str) -> anyhow::Result<Option<StatusRecord>> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.get_status(&name).await }
        })
        .await
    }

    async fn set_status(&self, name: &str, record: StatusRecord) -> anyhow::Result<()> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.set_status(&name, record).await }
        })
        .await
    }

    async fn clear(&self, name: &str) -> anyhow::Result<()> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.clear(&name).await }
        })
        .await
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        self.run("*", |backend| async move { backend.clear_all().await }).await
    }

    async fn event_log(&self, name: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.run(name, |backend| {
            let name = name.to_string();
            async move { backend.event_log(&name, limit).await }
        })
        .await
    }
}
