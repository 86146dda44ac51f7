//! No-op storage backend (§4.5 Null backend).

use super::{StatusRecord, StorageBackend};
use crate::event::Event;
use async_trait::async_trait;
use std::time::Duration;

/// A storage backend that records nothing and reports zero counts. Useful
/// for circuits whose only purpose is bulkhead isolation, or for tests that
/// want to strip out accounting overhead entirely.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorage;

#[async_trait]
impl StorageBackend for NullStorage {
    async fn record_success(&self, _name: &str, _duration: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_failure(
        &self,
        _name: &str,
        _duration: Duration,
        _error_info: Option<String>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn success_count(&self, _name: &str, _window_seconds: u64) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn failure_count(&self, _name: &str, _window_seconds: u64) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn get_status(&self, _name: &str) -> anyhow::Result<Option<StatusRecord>> {
        Ok(None)
    }

    async fn set_status(&self, _name: &str, _record: StatusRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn event_log(&self, _name: &str, _limit: usize) -> anyhow::Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn everything_is_a_no_op() {
        let storage = NullStorage;
        storage.record_success("x", Duration::from_millis(1)).await.unwrap();
        storage.record_failure("x", Duration::from_millis(1), Some("e".into())).await.unwrap();
        assert_eq!(storage.success_count("x", 60).await.unwrap(), 0);
        assert_eq!(storage.failure_count("x", 60).await.unwrap(), 0);
        assert!(storage.get_status("x").await.unwrap().is_none());
        assert!(storage.event_log("x", 10).await.unwrap().is_empty());
    }
}
