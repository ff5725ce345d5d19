//! # Document Store
//!
//! Whole-document storage addressed by path, with push subscriptions.
//!
//! The sync client only needs three things from a remote store: read a
//! document, overwrite a document, and get notified with the full content
//! whenever it changes. [`DocumentStore`] captures exactly that and is
//! injected into [`crate::SyncClient`] as `Arc<dyn DocumentStore>`.
//!
//! ## Implementations
//!
//! - [`MemoryStore`] - in-process, always available
//! - [`SqliteStore`] - SQLite file with MessagePack payloads (`persistence`)
//! - [`HttpStore`] - REST endpoint with polling subscriptions (`http`)

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{Result, UserId};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "persistence")]
mod sqlite;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteStore;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use http::{HttpStore, HttpStoreConfig};

// ============================================================================
// Paths
// ============================================================================

/// Slash-separated address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Join segments with `/`. A `/` inside a segment is escaped as `%2F`.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().replace('/', "%2F"))
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the per-identity document paths:
/// `{namespace}/{app_id}/{identity}/catalog` and `.../activation`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PathScheme {
    pub namespace: String,
    pub app_id: String,
}

impl Default for PathScheme {
    fn default() -> Self {
        Self {
            namespace: "artifacts".to_string(),
            app_id: "default-app-id".to_string(),
        }
    }
}

impl PathScheme {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
        }
    }

    pub fn catalog(&self, identity: &UserId) -> DocumentPath {
        self.document(identity, "catalog")
    }

    pub fn activation(&self, identity: &UserId) -> DocumentPath {
        self.document(identity, "activation")
    }

    fn document(&self, identity: &UserId, name: &str) -> DocumentPath {
        DocumentPath::from_segments([
            self.namespace.as_str(),
            self.app_id.as_str(),
            identity.as_str(),
            name,
        ])
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// A remote store of JSON-shaped documents with change notifications.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current content, or `None` if the document does not exist.
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>>;

    /// Replace the whole document. Subscribers are notified.
    async fn write(&self, path: &DocumentPath, payload: Value) -> Result<()>;

    /// Subscribe to the document. The current content is available
    /// immediately; every later write produces a new delivery.
    async fn subscribe(&self, path: &DocumentPath) -> Result<Subscription>;
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Live view of one document.
///
/// Dropping the subscription releases it, including any background task
/// that feeds it.
pub struct Subscription {
    receiver: watch::Receiver<Option<Value>>,
    feeder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(receiver: watch::Receiver<Option<Value>>) -> Self {
        Self {
            receiver,
            feeder: None,
        }
    }

    /// Subscription backed by a task that is aborted when this is dropped.
    pub(crate) fn with_feeder(receiver: watch::Receiver<Option<Value>>, feeder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            feeder: Some(feeder),
        }
    }

    /// Latest content, marking it as seen.
    pub fn latest(&mut self) -> Option<Value> {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the store side has gone away and no more
    /// deliveries will come. Deliveries that arrive faster than they are
    /// consumed collapse into the newest one.
    pub async fn next(&mut self) -> Option<Option<Value>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("has_feeder", &self.feeder.is_some())
            .finish()
    }
}

/// Per-path watch channels shared by the store implementations.
///
/// Each sender holds the last published content, so a fresh subscriber sees
/// the current document without another read.
#[derive(Default)]
pub(crate) struct WatchHub {
    channels: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Receiver for `path`; `seed` becomes the content if the channel is new.
    pub(crate) fn subscribe(&self, path: &DocumentPath, seed: Option<Value>) -> watch::Receiver<Option<Value>> {
        let mut channels = self.lock();
        match channels.get(path.as_str()) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = watch::channel(seed);
                channels.insert(path.as_str().to_string(), sender);
                receiver
            }
        }
    }

    /// Store `content` and notify every subscriber, even if unchanged.
    pub(crate) fn publish(&self, path: &DocumentPath, content: Option<Value>) {
        let mut channels = self.lock();
        match channels.get(path.as_str()) {
            Some(sender) => {
                sender.send_replace(content);
            }
            None => {
                let (sender, _) = watch::channel(content);
                channels.insert(path.as_str().to_string(), sender);
            }
        }
    }

    /// Notify subscribers only if `content` differs from the last value.
    pub(crate) fn publish_if_changed(&self, path: &DocumentPath, content: Option<Value>) -> bool {
        let mut channels = self.lock();
        match channels.get(path.as_str()) {
            Some(sender) => sender.send_if_modified(|current| {
                if *current == content {
                    false
                } else {
                    *current = content;
                    true
                }
            }),
            None => {
                let (sender, _) = watch::channel(content);
                channels.insert(path.as_str().to_string(), sender);
                true
            }
        }
    }

    /// Last published content; `None` if nothing was ever published here.
    pub(crate) fn current(&self, path: &DocumentPath) -> Option<Option<Value>> {
        self.lock()
            .get(path.as_str())
            .map(|sender| sender.borrow().clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<Option<Value>>>> {
        // A poisoned map still holds valid senders
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================
