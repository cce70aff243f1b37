//! Document provider: the crate's facade.
//!
//! One provider binds one replicated document to one store path and runs
//! the whole sync machinery behind it:
//!
//! ```text
//!                ┌───────────── DocProvider ─────────────┐
//!   engine ◀──── │ reconciler   batcher   compactor      │ ────▶ store
//!                │ room (links, awareness, bus)          │
//!                │ signaling (announce, relay, eviction) │
//!                └───────────────────────────────────────┘
//! ```
//!
//! The provider owns every background task it spawns and tears all of
//! them down in `destroy`. A room name can only be held by one provider
//! per [`SyncContext`]; starting a second is a configuration error, not a
//! silent second sync loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::batcher::{BatcherCtl, UpdateBatcher};
use crate::bus::LocalBus;
use crate::compactor::HistoryCompactor;
use crate::context::SyncContext;
use crate::crypto::{PayloadCipher, RoomKey};
use crate::engine::{Engine, EngineError};
use crate::reconciler::{ChangeFeedReconciler, ObservedIndex, ReconcileError};
use crate::room::{Room, RoomConfig, RoomEvent, RoomStats};
use crate::signaling::{MeshConfig, PeerMeshSignaling};
use crate::store::{paths, DocStore, StoreError};
use crate::transport::PeerTransport;

/// Tuning knobs for one document.
#[derive(Debug, Clone)]
pub struct DocOptions {
    /// Room password. Peers with a different password (or none) are
    /// invisible to each other.
    pub password: Option<String>,
    pub enable_awareness: bool,
    /// Flush once this many local updates have accumulated.
    pub max_updates_per_blob: usize,
    /// Flush when no new local update arrived for this long.
    pub max_update_pause: Duration,
    /// Update records older than this get folded into the baseline.
    pub blob_ttl: Duration,
    /// How often to attempt a compaction pass.
    pub compact_interval: Duration,
    pub mesh: MeshConfig,
}

impl Default for DocOptions {
    fn default() -> Self {
        Self {
            password: None,
            enable_awareness: true,
            max_updates_per_blob: 20,
            max_update_pause: Duration::from_millis(600),
            blob_ttl: Duration::from_secs(10),
            compact_interval: Duration::from_secs(10),
            mesh: MeshConfig::default(),
        }
    }
}

/// Collaborators and identity for one provider.
pub struct ProviderConfig {
    pub ctx: Arc<SyncContext>,
    pub store: Arc<dyn DocStore>,
    pub engine: Arc<dyn Engine>,
    pub transport: Arc<dyn PeerTransport>,
    pub cipher: Arc<dyn PayloadCipher>,
    /// Same-process fast path; `None` disables it.
    pub bus: Option<Arc<LocalBus>>,
    /// Document base path, also the room name.
    pub base: String,
    pub options: DocOptions,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Aggregate synced flag flipped.
    Synced(bool),
    PeersChanged,
    AwarenessChanged,
    /// The document was deleted remotely; this provider has shut down.
    Deleted,
    /// A background task failed terminally.
    Error(String),
}

pub struct DocProvider {
    ctx: Arc<SyncContext>,
    store: Arc<dyn DocStore>,
    base: String,
    room: Arc<Room>,
    signaling: Arc<PeerMeshSignaling>,
    index: Arc<ObservedIndex>,
    batcher_ctl: mpsc::UnboundedSender<BatcherCtl>,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderEvent>>>,
    last_error: Arc<Mutex<Option<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl DocProvider {
    /// Bring a document online: replay the baseline, then start the
    /// reconcile, batch, compact and mesh tasks.
    pub async fn start(cfg: ProviderConfig) -> Result<Arc<Self>, SyncError> {
        let ProviderConfig { ctx, store, engine, transport, cipher, bus, base, options } = cfg;

        if !ctx.register_room(&base) {
            return Err(SyncError::Config(format!("Room {base} already has a provider")));
        }

        let changes = engine.take_changes().ok_or_else(|| {
            ctx.unregister_room(&base);
            SyncError::Config("Engine change stream already taken".into())
        })?;

        let key = options.password.as_deref().map(|pw| RoomKey::derive(pw, &base));
        let index = ObservedIndex::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (room_event_tx, mut room_event_rx) = mpsc::unbounded_channel();
        let (batcher_ctl, batcher_ctl_rx) = mpsc::unbounded_channel();
        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut tasks = Vec::new();

        // Baseline before anything else, so the engine starts from the
        // compacted history.
        let reconciler = ChangeFeedReconciler::new(
            store.clone(),
            engine.clone(),
            base.clone(),
            index.clone(),
            shutdown_tx,
        );
        if let Err(e) = reconciler.load_baseline().await {
            ctx.unregister_room(&base);
            return Err(e.into());
        }
        {
            let tx = event_tx.clone();
            let last_error = last_error.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = reconciler.run().await {
                    log::error!("Reconciler stopped: {e}");
                    *last_error.lock().expect("provider lock") = Some(e.to_string());
                    let _ = tx.send(ProviderEvent::Error(e.to_string()));
                }
            }));
        }

        let batcher = UpdateBatcher::new(
            store.clone(),
            engine.clone(),
            ctx.clone(),
            base.clone(),
            options.max_updates_per_blob,
            options.max_update_pause,
        );
        tasks.push(tokio::spawn(batcher.run(changes, batcher_ctl_rx)));

        let compactor = HistoryCompactor::new(
            store.clone(),
            engine.clone(),
            ctx.clone(),
            base.clone(),
            index.clone(),
            options.blob_ttl,
        );
        tasks.push(tokio::spawn(compactor.run(options.compact_interval)));

        let room = Room::new(
            RoomConfig {
                peer_id: uuid::Uuid::new_v4(),
                name: base.clone(),
                client_id: engine.client_id(),
                awareness_enabled: options.enable_awareness,
                key: key.clone(),
            },
            transport,
            cipher.clone(),
            bus,
            signal_tx,
            room_event_tx,
        );
        room.join_bus().await;

        let signaling = PeerMeshSignaling::new(
            store.clone(),
            room.clone(),
            ctx.clone(),
            base.clone(),
            key,
            cipher,
            options.mesh.clone(),
        );
        {
            let signaling = signaling.clone();
            let tx = event_tx.clone();
            let last_error = last_error.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = signaling.run(signal_rx).await {
                    log::error!("Signaling stopped: {e}");
                    *last_error.lock().expect("provider lock") = Some(e.to_string());
                    let _ = tx.send(ProviderEvent::Error(e.to_string()));
                }
            }));
        }

        // Room events pass through to the application.
        {
            let tx = event_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(ev) = room_event_rx.recv().await {
                    let mapped = match ev {
                        RoomEvent::Synced(v) => ProviderEvent::Synced(v),
                        RoomEvent::PeersChanged => ProviderEvent::PeersChanged,
                        RoomEvent::AwarenessChanged => ProviderEvent::AwarenessChanged,
                    };
                    let _ = tx.send(mapped);
                }
            }));
        }

        let provider = Arc::new(Self {
            ctx,
            store,
            base,
            room,
            signaling,
            index,
            batcher_ctl,
            event_tx: event_tx.clone(),
            event_rx: Mutex::new(Some(event_rx)),
            last_error,
            tasks: Mutex::new(tasks),
            destroyed: AtomicBool::new(false),
        });

        // Supervisor: remote deletion tears this provider down.
        {
            let weak: Weak<DocProvider> = Arc::downgrade(&provider);
            let handle = tokio::spawn(async move {
                if shutdown_rx.recv().await.is_some() {
                    if let Some(provider) = weak.upgrade() {
                        let _ = provider.event_tx.send(ProviderEvent::Deleted);
                        tokio::spawn(async move { provider.teardown(false).await });
                    }
                }
            });
            provider.tasks.lock().expect("provider lock").push(handle);
        }

        log::info!("Provider started for {}", provider.base);
        Ok(provider)
    }

    /// Event stream. Can be taken exactly once.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.event_rx.lock().expect("provider lock").take()
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn peer_id(&self) -> uuid::Uuid {
        self.room.peer_id()
    }

    pub fn is_synced(&self) -> bool {
        self.room.is_synced()
    }

    /// Message of the most recent terminal background failure, if any.
    /// Set whenever a [`ProviderEvent::Error`] is emitted.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("provider lock").clone()
    }

    pub async fn stats(&self) -> RoomStats {
        self.room.stats().await
    }

    /// Replace this replica's awareness state and fan it out.
    pub async fn set_awareness(&self, state: Option<Vec<u8>>) {
        self.room.set_local_awareness(state).await;
    }

    pub fn awareness_entries(&self) -> Vec<crate::protocol::AwarenessEntry> {
        self.room.awareness_entries()
    }

    /// Flush pending local updates now instead of waiting for a trigger.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.batcher_ctl.send(BatcherCtl::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Graceful shutdown: flush, stop every task, withdraw from the mesh.
    /// Idempotent.
    pub async fn destroy(&self) {
        self.teardown(true).await;
    }

    async fn teardown(&self, flush: bool) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if flush {
            self.flush().await;
        }
        for task in self.tasks.lock().expect("provider lock").drain(..) {
            task.abort();
        }
        self.signaling.withdraw().await;
        self.room.leave().await;
        self.index.clear();
        self.ctx.unregister_room(&self.base);
        log::info!("Provider stopped for {}", self.base);
    }

    /// Delete the document's replicated history for every peer: write the
    /// shutdown sentinel, wipe baseline and every update record, shut down.
    ///
    /// The sentinel reaches live replicas through their change feeds before
    /// the wipe lands, so they tear down too. The wipe removes the sentinel
    /// itself as well; a provider opened on this path afterwards starts from
    /// an empty history.
    pub async fn delete_history(&self) -> Result<(), SyncError> {
        self.store.set(&paths::shutdown(&self.base), Vec::new()).await?;

        let records = self.store.list(&paths::updates(&self.base)).await?;
        let base = self.base.clone();
        self.store
            .transact(Box::new(move |tx| {
                tx.delete(&paths::baseline(&base));
                for record in &records {
                    tx.delete(&paths::update(&base, &record.id));
                }
                Ok(())
            }))
            .await?;

        self.teardown(false).await;
        Ok(())
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// Invalid wiring or duplicate room. Not retryable.
    Config(String),
    Store(StoreError),
    Engine(EngineError),
    Reconcile(ReconcileError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Engine(e) => write!(f, "{e}"),
            Self::Reconcile(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<EngineError> for SyncError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ReconcileError> for SyncError {
    fn from(e: ReconcileError) -> Self {
        Self::Reconcile(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Plaintext;
    use crate::engine::YrsEngine;
    use crate::store::memory::MemoryStore;
    use crate::transport::MemoryTransport;
    use yrs::{Text, Transact, WriteTxn};

    const BASE: &str = "rooms/doc";

    fn config(ctx: &Arc<SyncContext>, store: &MemoryStore, engine: Arc<YrsEngine>) -> ProviderConfig {
        ProviderConfig {
            ctx: ctx.clone(),
            store: Arc::new(store.clone()),
            engine,
            transport: Arc::new(MemoryTransport::new()),
            cipher: Arc::new(Plaintext),
            bus: None,
            base: BASE.to_string(),
            options: DocOptions::default(),
        }
    }

    fn edit(engine: &YrsEngine, content: &str) {
        let mut txn = engine.doc().transact_mut();
        let text = txn.get_or_insert_text("t");
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_room_rejected() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let e1 = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let e2 = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());

        let provider = DocProvider::start(config(&ctx, &store, e1)).await.unwrap();
        let err = DocProvider::start(config(&ctx, &store, e2)).await;
        assert!(matches!(err, Err(SyncError::Config(_))));

        // Destroy frees the name.
        provider.destroy().await;
        let e3 = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        assert!(DocProvider::start(config(&ctx, &store, e3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_flushed_on_destroy() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let provider = DocProvider::start(config(&ctx, &store, engine.clone())).await.unwrap();
        settle().await;

        edit(&engine, "unflushed");
        provider.destroy().await;

        let records = store.list(&paths::updates(BASE)).await.unwrap();
        assert_eq!(records.len(), 1, "destroy must drain the batcher");
        // Beacon withdrawn, room name free again.
        assert!(store.list(&paths::announces(BASE)).await.unwrap().is_empty());
        assert_eq!(ctx.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_idempotent() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let provider = DocProvider::start(config(&ctx, &store, engine)).await.unwrap();
        provider.destroy().await;
        provider.destroy().await;
        assert_eq!(ctx.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_rx_take_once() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let provider = DocProvider::start(config(&ctx, &store, engine)).await.unwrap();
        assert!(provider.take_event_rx().is_some());
        assert!(provider.take_event_rx().is_none());
        provider.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_history_wipes_everything() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let provider = DocProvider::start(config(&ctx, &store, engine.clone())).await.unwrap();
        settle().await;

        edit(&engine, "doomed");
        provider.flush().await;
        assert!(!store.list(&paths::updates(BASE)).await.unwrap().is_empty());

        provider.delete_history().await.unwrap();
        assert!(store.list(&paths::updates(BASE)).await.unwrap().is_empty());
        assert!(store.get(&paths::baseline(BASE)).await.unwrap().is_none());
        assert_eq!(ctx.room_count(), 0);

        // The path is reusable: a fresh provider starts from empty history.
        let fresh = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let reopened = DocProvider::start(config(&ctx, &store, fresh)).await.unwrap();
        settle().await;
        assert_eq!(ctx.room_count(), 1);
        reopened.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_failure_surfaced_as_error() {
        let ctx = SyncContext::new();
        let store = MemoryStore::new();
        let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());

        store.fail_next_watch();
        let provider = DocProvider::start(config(&ctx, &store, engine)).await.unwrap();
        let mut events = provider.take_event_rx().unwrap();
        settle().await;

        let error = provider.last_error();
        assert!(error.is_some(), "failed feed must be readable on the provider");
        let mut saw_error_event = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, ProviderEvent::Error(_)) {
                saw_error_event = true;
            }
        }
        assert!(saw_error_event, "failed feed must emit an error event");
        provider.destroy().await;
    }
}
