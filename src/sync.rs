//! # Sync Client
//!
//! Keeps a local copy of one user's catalog and activation state in step
//! with a [`DocumentStore`].
//!
//! ## Architecture
//!
//! Each identity owns two documents:
//! - `{namespace}/{app_id}/{identity}/catalog` holding `{ "list": [Route] }`
//! - `{namespace}/{app_id}/{identity}/activation` holding `{ "active": {id: bool} }`
//!
//! [`SyncClient::connect`] subscribes to both and spawns one task per
//! document that applies every delivered snapshot to the local state.
//! Writes are whole-document overwrites and are applied locally before the
//! store confirms them.
//!
//! ## Reconciliation
//!
//! Local changes are optimistic and never rolled back. Writes to one document
//! go out one at a time, each carrying the latest local content, so
//! overlapping changes to different route ids all reach the store. While a
//! write is in flight, the newest snapshot of that document is held back and
//! applied once the last pending write finishes, so a change made elsewhere
//! during the write still lands locally. Otherwise every delivered snapshot
//! replaces the local copy.
//!
//! A failed write is logged, returned to the caller and announced as
//! [`SyncEvent::WriteFailed`]. The local change stays visible and
//! [`SyncClient::has_unconfirmed_writes`] reports it until the next snapshot
//! of that document or the next successful write.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::parser::{parse_with, summarize, ImportOptions};
use crate::query::{evaluate, filter_options, FilterOptions, QueryParams, QueryResult};
use crate::store::{DocumentPath, DocumentStore, PathScheme, Subscription};
use crate::{ActivationState, CatalogError, Result, Route, UserId};

// ============================================================================
// Core Types
// ============================================================================

/// Which of the two per-identity documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Catalog,
    Activation,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Catalog => f.write_str("catalog"),
            DocumentKind::Activation => f.write_str("activation"),
        }
    }
}

/// Connection lifecycle for the current identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Subscribed, waiting for the first snapshot of both documents
    Connecting,
    Synced,
}

/// Sync event types for notifying the shell of changes
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CatalogChanged,
    ActivationChanged,
    StateChanged(ConnectionState),
    WriteFailed { document: DocumentKind },
}

/// Outcome of a write that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// The store accepted the write
    Confirmed,
    /// No identity (or it changed before the write went out); nothing stored
    Skipped,
}

/// Stored catalog document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub list: Vec<Route>,
}

/// Stored activation document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationDocument {
    #[serde(default)]
    pub active: ActivationState,
}

// Borrowed forms used when serializing the local copy
#[derive(Serialize)]
struct CatalogDocumentRef<'a> {
    list: &'a [Route],
}

#[derive(Serialize)]
struct ActivationDocumentRef<'a> {
    active: &'a ActivationState,
}

/// Sync client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub paths: PathScheme,
    /// Options used by [`SyncClient::import`]
    pub import: ImportOptions,
    /// Buffered events per receiver before slow receivers start lagging
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            paths: PathScheme::default(),
            import: ImportOptions::default(),
            event_capacity: 64,
        }
    }
}

/// Snapshot of the client's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub state: ConnectionState,
    pub route_count: usize,
    pub activation_entries: usize,
    pub active_count: usize,
    pub unconfirmed_catalog: bool,
    pub unconfirmed_activation: bool,
}

// ============================================================================
// Local State
// ============================================================================

/// Per-document bookkeeping.
#[derive(Debug, Default)]
struct DocumentStatus {
    /// First snapshot of this session received
    synced: bool,
    /// Local changes waiting for their write to finish
    pending: u32,
    /// Last write failed and nothing has superseded it yet
    failed: bool,
    /// Newest snapshot delivered while `pending > 0`
    deferred: Option<Option<Value>>,
}

impl DocumentStatus {
    fn unconfirmed(&self) -> bool {
        self.pending > 0 || self.failed
    }
}

struct LocalState {
    /// Bumped on every connect/disconnect; work from older sessions is dropped
    generation: u64,
    identity: Option<UserId>,
    state: ConnectionState,
    catalog: Arc<Vec<Route>>,
    activation: ActivationState,
    catalog_status: DocumentStatus,
    activation_status: DocumentStatus,
}

impl LocalState {
    fn new() -> Self {
        Self {
            generation: 0,
            identity: None,
            state: ConnectionState::Disconnected,
            catalog: Arc::new(Vec::new()),
            activation: ActivationState::new(),
            catalog_status: DocumentStatus::default(),
            activation_status: DocumentStatus::default(),
        }
    }

    fn reset_documents(&mut self) {
        self.catalog = Arc::new(Vec::new());
        self.activation = ActivationState::new();
        self.catalog_status = DocumentStatus::default();
        self.activation_status = DocumentStatus::default();
    }

    fn status_mut(&mut self, kind: DocumentKind) -> &mut DocumentStatus {
        match kind {
            DocumentKind::Catalog => &mut self.catalog_status,
            DocumentKind::Activation => &mut self.activation_status,
        }
    }

    /// Replace one document with delivered content.
    ///
    /// Malformed content is logged and leaves the local copy untouched.
    fn apply_content(
        &mut self,
        kind: DocumentKind,
        content: Option<Value>,
        path: &DocumentPath,
    ) -> Option<SyncEvent> {
        match kind {
            DocumentKind::Catalog => match decode::<CatalogDocument>(content, path) {
                Ok(doc) => {
                    debug!("[SyncClient] catalog snapshot: {} routes", doc.list.len());
                    self.catalog = Arc::new(doc.list);
                    self.catalog_status.failed = false;
                    Some(SyncEvent::CatalogChanged)
                }
                Err(e) => {
                    warn!("[SyncClient] Ignoring catalog snapshot: {}", e);
                    None
                }
            },
            DocumentKind::Activation => match decode::<ActivationDocument>(content, path) {
                Ok(doc) => {
                    debug!(
                        "[SyncClient] activation snapshot: {} entries",
                        doc.active.len()
                    );
                    self.activation = doc.active;
                    self.activation_status.failed = false;
                    Some(SyncEvent::ActivationChanged)
                }
                Err(e) => {
                    warn!("[SyncClient] Ignoring activation snapshot: {}", e);
                    None
                }
            },
        }
    }

    fn payload(&self, kind: DocumentKind) -> serde_json::Result<Value> {
        match kind {
            DocumentKind::Catalog => serde_json::to_value(CatalogDocumentRef {
                list: &self.catalog,
            }),
            DocumentKind::Activation => serde_json::to_value(ActivationDocumentRef {
                active: &self.activation,
            }),
        }
    }
}

type SharedState = Arc<Mutex<LocalState>>;

fn lock_state(shared: &SharedState) -> MutexGuard<'_, LocalState> {
    // State is plain data; a panic mid-update cannot leave it unusable
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// A local change that has been applied and still has to be written.
struct PendingWrite {
    kind: DocumentKind,
    path: DocumentPath,
    generation: u64,
}

struct Session {
    feeds: Vec<JoinHandle<()>>,
}

impl Session {
    fn close(self) {
        // Aborting a feed drops its Subscription, which releases the listener
        for feed in self.feeds {
            feed.abort();
        }
    }
}

// ============================================================================
// Sync Client
// ============================================================================

/// Mirrors one identity's catalog and activation state from a document store.
///
/// All methods take `&self`, so the client can be shared behind an `Arc`.
/// `connect` needs a running tokio runtime.
pub struct SyncClient {
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    shared: SharedState,
    session: Mutex<Option<Session>>,
    // Held across the store write so writes to one document stay ordered
    catalog_writes: tokio::sync::Mutex<()>,
    activation_writes: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a disconnected client for `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            config,
            shared: Arc::new(Mutex::new(LocalState::new())),
            session: Mutex::new(None),
            catalog_writes: tokio::sync::Mutex::new(()),
            activation_writes: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Create a client with default configuration.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, SyncConfig::default())
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    /// Subscribe to `identity`'s documents.
    ///
    /// Connecting to the identity already connected is a no-op. Any other
    /// identity first tears down the current session and clears local state.
    pub async fn connect(&self, identity: impl Into<UserId>) -> Result<()> {
        let identity = identity.into();

        {
            let local = lock_state(&self.shared);
            if local.identity.as_ref() == Some(&identity)
                && local.state != ConnectionState::Disconnected
            {
                debug!("[SyncClient] Already connected as {}", identity);
                return Ok(());
            }
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| CatalogError::Runtime {
            message: format!("connect requires a tokio runtime: {}", e),
        })?;

        self.disconnect();

        let generation = {
            let mut local = lock_state(&self.shared);
            local.generation += 1;
            local.identity = Some(identity.clone());
            local.reset_documents();
            local.state = ConnectionState::Connecting;
            local.generation
        };
        self.emit(SyncEvent::StateChanged(ConnectionState::Connecting));
        info!("[SyncClient] Connecting as {}", identity);

        let catalog_path = self.config.paths.catalog(&identity);
        let activation_path = self.config.paths.activation(&identity);

        let catalog_sub = self.open(&catalog_path).await?;
        let activation_sub = self.open(&activation_path).await?;

        let feeds = vec![
            runtime.spawn(run_feed(
                DocumentKind::Catalog,
                catalog_sub,
                catalog_path,
                Arc::clone(&self.shared),
                self.events.clone(),
                generation,
            )),
            runtime.spawn(run_feed(
                DocumentKind::Activation,
                activation_sub,
                activation_path,
                Arc::clone(&self.shared),
                self.events.clone(),
                generation,
            )),
        ];

        let mut session = self.lock_session();
        if let Some(previous) = session.replace(Session { feeds }) {
            previous.close();
        }
        Ok(())
    }

    async fn open(&self, path: &DocumentPath) -> Result<Subscription> {
        match self.store.subscribe(path).await {
            Ok(sub) => Ok(sub),
            Err(e) => {
                error!("[SyncClient] Subscribe to {} failed: {}", path, e);
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Release both subscriptions and forget the identity.
    pub fn disconnect(&self) {
        if let Some(session) = self.lock_session().take() {
            session.close();
        }

        let was_connected = {
            let mut local = lock_state(&self.shared);
            let was_connected = local.state != ConnectionState::Disconnected;
            local.generation += 1;
            local.identity = None;
            local.reset_documents();
            local.state = ConnectionState::Disconnected;
            was_connected
        };

        if was_connected {
            info!("[SyncClient] Disconnected");
            self.emit(SyncEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replace the catalog with `routes`.
    pub async fn save_catalog(&self, routes: Vec<Route>) -> Result<WriteAck> {
        let routes = Arc::new(routes);
        let pending = self.apply_local(DocumentKind::Catalog, |local| {
            local.catalog = routes;
        });
        match pending {
            Some(pending) => self.write(pending).await,
            None => {
                debug!("[SyncClient] No identity, catalog save skipped");
                Ok(WriteAck::Skipped)
            }
        }
    }

    /// Set one route's activation flag and store the whole map.
    ///
    /// The change is visible locally as soon as the call starts running.
    /// Overlapping calls for different ids all end up in the stored map.
    pub async fn set_active(&self, route_id: &str, active: bool) -> Result<WriteAck> {
        let pending = self.apply_local(DocumentKind::Activation, |local| {
            local.activation.set(route_id, active);
        });
        self.write_activation(pending).await
    }

    /// Flip one route's activation flag.
    pub async fn toggle(&self, route_id: &str) -> Result<WriteAck> {
        let pending = self.apply_local(DocumentKind::Activation, |local| {
            local.activation.toggle(route_id);
        });
        self.write_activation(pending).await
    }

    async fn write_activation(&self, pending: Option<PendingWrite>) -> Result<WriteAck> {
        match pending {
            Some(pending) => self.write(pending).await,
            None => {
                debug!("[SyncClient] No identity, activation change skipped");
                Ok(WriteAck::Skipped)
            }
        }
    }

    /// Parse an import and replace the catalog with it.
    pub async fn import(&self, raw_text: &str, source_label: &str) -> Result<WriteAck> {
        let routes = parse_with(raw_text, source_label, &self.config.import);
        let summary = summarize(&routes);
        info!(
            "[SyncClient] Imported {} routes from '{}' ({} with stopover, {} unnamed, total profit {:.0})",
            summary.route_count,
            source_label,
            summary.stopover_count,
            summary.unnamed_count,
            summary.total_profit
        );
        self.save_catalog(routes).await
    }

    /// Apply a change to the local copy. `None` without an identity.
    fn apply_local<F>(&self, kind: DocumentKind, change: F) -> Option<PendingWrite>
    where
        F: FnOnce(&mut LocalState),
    {
        let pending = {
            let mut local = lock_state(&self.shared);
            let identity = local.identity.clone()?;
            change(&mut *local);
            local.status_mut(kind).pending += 1;
            let path = match kind {
                DocumentKind::Catalog => self.config.paths.catalog(&identity),
                DocumentKind::Activation => self.config.paths.activation(&identity),
            };
            PendingWrite {
                kind,
                path,
                generation: local.generation,
            }
        };

        self.emit(match kind {
            DocumentKind::Catalog => SyncEvent::CatalogChanged,
            DocumentKind::Activation => SyncEvent::ActivationChanged,
        });
        Some(pending)
    }

    /// Write the latest local content of a document.
    async fn write(&self, pending: PendingWrite) -> Result<WriteAck> {
        let PendingWrite {
            kind,
            path,
            generation,
        } = pending;

        let _ordered = match kind {
            DocumentKind::Catalog => self.catalog_writes.lock().await,
            DocumentKind::Activation => self.activation_writes.lock().await,
        };

        let payload = {
            let local = lock_state(&self.shared);
            if local.generation != generation {
                debug!("[SyncClient] Session changed, {} write to {} dropped", kind, path);
                return Ok(WriteAck::Skipped);
            }
            local.payload(kind)
        };

        let outcome = match payload {
            Ok(payload) => self.store.write(&path, payload).await,
            Err(e) => Err(e.into()),
        };
        self.finish_write(kind, &path, generation, outcome.is_ok());

        match outcome {
            Ok(()) => {
                debug!("[SyncClient] {} saved to {}", kind, path);
                Ok(WriteAck::Confirmed)
            }
            Err(e) => {
                error!(
                    "[SyncClient] {} write to {} failed, keeping local change: {}",
                    kind, path, e
                );
                self.emit(SyncEvent::WriteFailed { document: kind });
                Err(e)
            }
        }
    }

    fn finish_write(
        &self,
        kind: DocumentKind,
        path: &DocumentPath,
        generation: u64,
        succeeded: bool,
    ) {
        let event = {
            let mut local = lock_state(&self.shared);
            if local.generation != generation {
                return;
            }
            let status = local.status_mut(kind);
            status.pending = status.pending.saturating_sub(1);
            // A successful write carries every earlier local change too
            status.failed = !succeeded;
            if status.pending > 0 {
                return;
            }
            let deferred = status.deferred.take();
            match deferred {
                Some(content) => {
                    debug!("[SyncClient] Applying {} snapshot held during write", kind);
                    local.apply_content(kind, content, path)
                }
                None => None,
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn identity(&self) -> Option<UserId> {
        lock_state(&self.shared).identity.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock_state(&self.shared).state
    }

    /// Current local catalog (shared, cheap to clone).
    pub fn catalog(&self) -> Arc<Vec<Route>> {
        Arc::clone(&lock_state(&self.shared).catalog)
    }

    pub fn activation(&self) -> ActivationState {
        lock_state(&self.shared).activation.clone()
    }

    /// Run the query engine over the current local state.
    pub fn evaluate(&self, params: &QueryParams) -> QueryResult {
        let (catalog, activation) = {
            let local = lock_state(&self.shared);
            (Arc::clone(&local.catalog), local.activation.clone())
        };
        evaluate(&catalog, &activation, params)
    }

    /// Dropdown values derived from the current catalog.
    pub fn filter_options(&self) -> FilterOptions {
        filter_options(&self.catalog())
    }

    /// Whether either document has local changes the store has not confirmed.
    pub fn has_unconfirmed_writes(&self) -> bool {
        let local = lock_state(&self.shared);
        local.catalog_status.unconfirmed() || local.activation_status.unconfirmed()
    }

    pub fn stats(&self) -> SyncStats {
        let local = lock_state(&self.shared);
        SyncStats {
            state: local.state,
            route_count: local.catalog.len(),
            activation_entries: local.activation.len(),
            active_count: local.activation.active_count(),
            unconfirmed_catalog: local.catalog_status.unconfirmed(),
            unconfirmed_activation: local.activation_status.unconfirmed(),
        }
    }

    /// Receive change notifications from now on.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(session) = self.lock_session().take() {
            session.close();
        }
    }
}

// ============================================================================
// Snapshot Feeds
// ============================================================================

async fn run_feed(
    kind: DocumentKind,
    mut subscription: Subscription,
    path: DocumentPath,
    shared: SharedState,
    events: broadcast::Sender<SyncEvent>,
    generation: u64,
) {
    let mut content = subscription.latest();
    loop {
        if !apply_snapshot(kind, content, &path, &shared, &events, generation) {
            debug!("[SyncClient] {} feed for stale session stopped", kind);
            return;
        }
        match subscription.next().await {
            Some(next) => content = next,
            None => {
                debug!("[SyncClient] {} subscription closed", kind);
                return;
            }
        }
    }
}

/// Apply one delivery. Returns false if the session it belongs to is gone.
fn apply_snapshot(
    kind: DocumentKind,
    content: Option<Value>,
    path: &DocumentPath,
    shared: &SharedState,
    events: &broadcast::Sender<SyncEvent>,
    generation: u64,
) -> bool {
    let mut emitted = Vec::with_capacity(2);

    {
        let mut local = lock_state(shared);
        if local.generation != generation {
            return false;
        }

        let status = local.status_mut(kind);
        status.synced = true;
        if status.pending > 0 {
            debug!("[SyncClient] {} write in flight, snapshot held back", kind);
            status.deferred = Some(content);
        } else if let Some(event) = local.apply_content(kind, content, path) {
            emitted.push(event);
        }

        if local.state == ConnectionState::Connecting
            && local.catalog_status.synced
            && local.activation_status.synced
        {
            local.state = ConnectionState::Synced;
            info!("[SyncClient] Synced");
            emitted.push(SyncEvent::StateChanged(ConnectionState::Synced));
        }
    }

    for event in emitted {
        let _ = events.send(event);
    }
    true
}

/// A missing document reads as the empty document.
fn decode<T>(content: Option<Value>, path: &DocumentPath) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    match content {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| CatalogError::InvalidDocument {
            path: path.to_string(),
            message: e.to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
