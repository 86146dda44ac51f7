//! Bounded per-event sliding-window storage (§4.5 Memory backend).

use super::{StatusRecord, StorageBackend};
use crate::event::{Event, EventKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CircuitRecord {
    events: VecDeque<Event>,
    status: Option<StatusRecord>,
}

impl CircuitRecord {
    fn new() -> Self {
        Self { events: VecDeque::new(), status: None }
    }
}

/// Each circuit gets a bounded ring buffer of events capped at `max_events`;
/// insertion evicts the oldest. `count` walks the buffer and includes events
/// with `timestamp_ms >= now - window` (§4.5). Guarded by a per-circuit
/// entry in a sharded map so circuits never contend on each other's locks.
pub struct MemoryStorage {
    max_events: usize,
    origin: Instant,
    circuits: RwLock<HashMap<String, Arc<RwLock<CircuitRecord>>>>,
}

impl MemoryStorage {
    /// Create a new memory backend with the given per-circuit buffer cap.
    pub fn new(max_events: usize) -> Self {
        Self { max_events: max_events.max(1), origin: Instant::now(), circuits: RwLock::new(HashMap::new()) }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    async fn entry(&self, name: &str) -> Arc<RwLock<CircuitRecord>> {
        if let Some(existing) = self.circuits.read().await.get(name) {
            return existing.clone();
        }
        let mut write = self.circuits.write().await;
        write.entry(name.to_string()).or_insert_with(|| Arc::new(RwLock::new(CircuitRecord::new()))).clone()
    }

    async fn push(&self, name: &str, event: Event) {
        let record = self.entry(name).await;
        let mut record = record.write().await;
        if record.events.len() >= self.max_events {
            record.events.pop_front();
        }
        record.events.push_back(event);
    }

    async fn count(&self, name: &str, window_seconds: u64, kind: EventKind) -> u64 {
        let record = self.entry(name).await;
        let record = record.read().await;
        let now = self.now_ms();
        let window_ms = window_seconds.saturating_mul(1000);
        record
            .events
            .iter()
            .filter(|e| e.kind == kind && now.saturating_sub(e.timestamp_ms) <= window_ms)
            .count() as u64
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn record_success(&self, name: &str, duration: Duration) -> anyhow::Result<()> {
        self.push(name, Event::success(self.now_ms(), duration)).await;
        Ok(())
    }

    async fn record_failure(
        &self,
        name: &str,
        duration: Duration,
        error_info: Option<String>,
    ) -> anyhow::Result<()> {
        self.push(name, Event::failure(self.now_ms(), duration, None, error_info)).await;
        Ok(())
    }

    async fn success_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        Ok(self.count(name, window_seconds, EventKind::Success).await)
    }

    async fn failure_count(&self, name: &str, window_seconds: u64) -> anyhow::Result<u64> {
        Ok(self.count(name, window_seconds, EventKind::Failure).await)
    }

    async fn get_status(&self, name: &str) -> anyhow::Result<Option<StatusRecord>> {
        let record = self.entry(name).await;
        Ok(record.read().await.status)
    }

    async fn set_status(&self, name: &str, status: StatusRecord) -> anyhow::Result<()> {
        let record = self.entry(name).await;
        record.write().await.status = Some(status);
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
        let record = self.entry(name).await;
        let record = record.read().await;
        Ok(record.events.iter().rev().take(limit).cloned().collect())
    }
}
