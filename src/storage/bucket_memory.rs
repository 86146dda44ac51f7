//! Bucketed sliding-window storage, the default backend (§4.5).
//!
//! Rather than keeping every event (as [`super::memory::MemoryStorage`]
//! does), this backend aggregates counts into a ring of one-second-wide
//! buckets. Memory is bounded by `bucket_count` regardless of call volume,
//! at the cost of only supporting window queries aligned to whole seconds.

use super::{StatusRecord, StorageBackend};
use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone, Copy, Default)]
struct Bucket {
    second: u64,
    successes: u64,
    failures: u64,
}

struct CircuitBuckets {
    buckets: Vec<Bucket>,
    status: Option<StatusRecord>,
    recent: Vec<Event>,
}

impl CircuitBuckets {
    fn new(bucket_count: usize) -> Self {
        Self { buckets: vec![Bucket::default(); bucket_count], status: None, recent: Vec::new() }
    }

    fn bucket_mut(&mut self, second: u64) -> &mut Bucket {
        let len = self.buckets.len() as u64;
        let slot = &mut self.buckets[(second % len) as usize];
        if slot.second != second {
            *slot = Bucket { second, successes: 0, failures: 0 };
        }
        slot
    }

    fn count(&self, now_second: u64, window_seconds: u64, success: bool) -> u64 {
        // Buckets never written still default to `second: 0`, but that's
        // harmless here: an unwritten bucket holds zero successes/failures
        // regardless of whether the window filter below considers it
        // in-range, so there's no need to special-case it out.
        self.buckets
            .iter()
            .filter(|b| now_second.saturating_sub(b.second) < window_seconds)
            .map(|b| if success { b.successes } else { b.failures })
            .sum()
    }

    fn push_recent(&mut self, event: Event, cap: usize) {
        if self.recent.len() >= cap {
            self.recent.remove(0);
        }
        self.recent.push(event);
    }
}

/// Bucketed storage backend: `bucket_count` one-second buckets per circuit,
/// recycled as time advances. This is the default backend for a circuit that
/// does not specify one.
pub struct BucketMemoryStorage {
    bucket_count: usize,
    recent_cap: usize,
    origin: Instant,
    circuits: RwLock<HashMap<String, CircuitBuckets>>,
}

impl BucketMemoryStorage {
    /// Create a backend with `bucket_count` one-second buckets per circuit.
    pub fn new(bucket_count: usize) -> Self {
        Self {
            bucket_count: bucket_count.max(1),
            recent_cap: 50,
            origin: Instant::now(),
            circuits: RwLock::new(HashMap::new()),
        }
    }

    fn now_second(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[async_trait]
impl StorageBackend for BucketMemoryStorage {
    async fn record_success(&self, name: &str, duration: Duration) -> anyhow::Result<()> {
        let second = self.now_second();
        let mut circuits = self.circuits.write().await;
        let record = circuits.entry(name.to_string()).or_insert_with(|| CircuitBuckets::new(self.bucket_count));
        record.bucket_mut(second).successes += 1;
        record.push_recent(Event::success(self.now_ms(), duration), self.recent_cap);
        Ok(())
    }

    async fn record_failure(
        &self,
        name: &str,
        duration: Duration,
        error_info: Option<String>,
    ) -> anyhow::Result<()> {
        let second = self.now_second();
        let now_ms = self.now_ms();
        let mut circuits = self.circuits.write().await;
        let record = circuits.entry(name.to_string()).or_insert_with(|| CircuitBuckets::new(self.bucket_count));
        record.bucket_mut(second).failures += 1;
        record.push_recent(Event::failure(now_ms, duration, None, error_info), self.recent_cap);
        Ok(())
    }

    async fn success_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        let circuits = self.circuits.read().await;
        Ok(circuits.get(name).map(|r| r.count(self.now_second(), window_seconds, true)).unwrap_or(0))
    }

    async fn failure_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        let circuits = self.circuits.read().await;
        Ok(circuits.get(name).map(|r| r.count(self.now_second(), window_seconds, false)).unwrap_or(0))
    }

    async fn get_status(&self, name: &str) -> anyhow::Result<Option<StatusRecord>> {
        let circuits = self.circuits.read().await;
        Ok(circuits.get(name).and_then(|r| r.status))
    }

    async fn set_status(&self, name: &str, status: StatusRecord) -> anyhow::Result<()> {
        let mut circuits = self.circuits.write().await;
        circuits.entry(name.to_string()).or_insert_with(|| CircuitBuckets::new(self.bucket_count)).status =
            Some(status);
        Ok(())
    }

    async fn clear(&self, name: &str) -> anyhow::Result<()> {
        self.circuits.write().await.remove(name);
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        self.circuits.write().await.clear();
        Ok(())
    }

    async fn event_log(&self, name: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        let circuits = self.circuits.read().await;
        Ok(circuits
            .get(name)
            .map(|r| r.recent.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_within_window() {
        let storage = BucketMemoryStorage::new(60);
        for _ in 0..4 {
            storage.record_success("svc", Duration::from_millis(1)).await.unwrap();
        }
        storage.record_failure("svc", Duration::from_millis(1), Some("e".into())).await.unwrap();

        assert_eq!(storage.success_count("svc", 60).await.unwrap(), 4);
        assert_eq!(storage.failure_count("svc", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_circuit_counts_as_zero() {
        let storage = BucketMemoryStorage::new(60);
        assert_eq!(storage.success_count("ghost", 60).await.unwrap(), 0);
        assert!(storage.get_status("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_round_trips() {
        let storage = BucketMemoryStorage::new(60);
        storage
            .set_status("svc", StatusRecord { state: super::super::PersistedState::Open, opened_at: Some(123.0) })
            .await
            .unwrap();
        let status = storage.get_status("svc").await.unwrap().unwrap();
        assert_eq!(status.state, super::super::PersistedState::Open);
        assert_eq!(status.opened_at, Some(123.0));
    }

    #[tokio::test]
    async fn recent_events_capped_and_ordered() {
        let storage = BucketMemoryStorage::new(60);
        for i in 0..5 {
            storage.record_success("svc", Duration::from_millis(i)).await.unwrap();
        }
        let log = storage.event_log("svc", 3).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].duration, Some(Duration::from_millis(4)));
    }
}
