//! In-process document store.
//!
//! Documents live in the watch channels of a [`WatchHub`], so reads,
//! writes and subscriptions all see the same value. Useful as the store for
//! tests and for running the sync client without a backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::{DocumentPath, DocumentStore, Subscription, WatchHub};
use crate::{CatalogError, Result};

/// Document store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    hub: WatchHub,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            hub: WatchHub::new(),
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// While offline, writes fail with [`CatalogError::StoreUnavailable`].
    /// Reads and subscriptions keep working.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>> {
        Ok(self.hub.current(path).flatten())
    }

    async fn write(&self, path: &DocumentPath, payload: Value) -> Result<()> {
        if self.is_offline() {
            return Err(CatalogError::StoreUnavailable {
                message: format!("memory store is offline, write to {} rejected", path),
            });
        }
        debug!("[MemoryStore] write {}", path);
        self.hub.publish(path, Some(payload));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> Result<Subscription> {
        Ok(Subscription::new(self.hub.subscribe(path, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(name: &str) -> DocumentPath {
        DocumentPath::from_segments(["artifacts", "test", "user", name])
    }

    #[tokio::test]
    async fn test_read_missing_document() {
        let store = MemoryStore::new();
        assert_eq!(store.read(&path("catalog")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write(&path("catalog"), json!({"list": []})).await.unwrap();
        assert_eq!(
            store.read(&path("catalog")).await.unwrap(),
            Some(json!({"list": []}))
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_before_document_exists() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("activation")).await.unwrap();
        assert_eq!(sub.latest(), None);

        store
            .write(&path("activation"), json!({"active": {"a": true}}))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(Some(json!({"active": {"a": true}}))));
    }

    #[tokio::test]
    async fn test_every_write_notifies() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("catalog")).await.unwrap();
        sub.latest();

        store.write(&path("catalog"), json!({"list": []})).await.unwrap();
        assert!(sub.next().await.is_some());

        // Same content again still counts as a delivery
        store.write(&path("catalog"), json!({"list": []})).await.unwrap();
        assert!(sub.next().await.is_some());
    }

    #[tokio::test]
    async fn test_offline_rejects_writes() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store
            .write(&path("catalog"), json!({"list": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::StoreUnavailable { .. }));
        assert_eq!(store.read(&path("catalog")).await.unwrap(), None);
        assert_eq!(store.write_count(), 0);

        store.set_offline(false);
        store.write(&path("catalog"), json!({"list": []})).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_paths_are_independent() {
        let store = MemoryStore::new();
        store.write(&path("catalog"), json!(1)).await.unwrap();
        assert_eq!(store.read(&path("activation")).await.unwrap(), None);
    }
}
