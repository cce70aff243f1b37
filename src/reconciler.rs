//! Change-feed reconciliation.
//!
//! The read half of the sync loop. On startup the reconciler replays the
//! compacted baseline into the engine, then follows the change feed of the
//! update collection:
//!
//! ```text
//!   baseline ──apply──▶ engine ◀──apply── remote update records
//!                                   │
//!                 observed index ◀──┘ (fed to the compactor)
//! ```
//!
//! Records written by the local client are indexed but never re-applied;
//! the engine already holds those edits. A record carrying the shutdown
//! sentinel id means the document was deleted remotely, and the provider
//! is told to tear down.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::engine::{Engine, EngineError, UpdateOrigin};
use crate::protocol::UpdateId;
use crate::store::{paths, DocStore, FeedKind, Millis, StoreError};

/// Update records this replica has seen on the feed, with their
/// server-assigned creation times. The compactor consumes it to decide
/// which records are stale without re-listing the store.
pub struct ObservedIndex {
    inner: Mutex<HashMap<String, Millis>>,
}

impl ObservedIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(HashMap::new()) })
    }

    pub fn record(&self, id: &str, created_at: Millis) {
        self.inner.lock().expect("index lock").insert(id.to_string(), created_at);
    }

    pub fn forget(&self, id: &str) {
        self.inner.lock().expect("index lock").remove(id);
    }

    /// Ids created strictly before `cutoff`.
    pub fn stale_ids(&self, cutoff: Millis) -> Vec<String> {
        let inner = self.inner.lock().expect("index lock");
        let mut ids: Vec<String> = inner
            .iter()
            .filter(|(_, created)| **created < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.inner.lock().expect("index lock").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Follows the update collection's change feed and applies remote records
/// to the local engine.
pub struct ChangeFeedReconciler {
    store: Arc<dyn DocStore>,
    engine: Arc<dyn Engine>,
    base: String,
    index: Arc<ObservedIndex>,
    /// Fired once when the shutdown sentinel appears on the feed.
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_sent: bool,
}

impl ChangeFeedReconciler {
    pub fn new(
        store: Arc<dyn DocStore>,
        engine: Arc<dyn Engine>,
        base: String,
        index: Arc<ObservedIndex>,
        shutdown_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self { store, engine, base, index, shutdown_tx, shutdown_sent: false }
    }

    /// Replay the compacted baseline, if any, into the engine.
    pub async fn load_baseline(&self) -> Result<(), ReconcileError> {
        let Some(doc) = self.store.get(&paths::baseline(&self.base)).await? else {
            log::debug!("No baseline for {}", self.base);
            return Ok(());
        };
        let payload = lz4_flex::decompress_size_prepended(&doc.data)
            .map_err(|e| ReconcileError::Corrupt(e.to_string()))?;
        self.engine.apply_update(&payload, UpdateOrigin::Provider)?;
        log::debug!("Baseline applied for {} ({} bytes)", self.base, payload.len());
        Ok(())
    }

    /// Follow the change feed until it closes. The watch's initial
    /// snapshot covers records written before this replica arrived.
    pub async fn run(mut self) -> Result<(), ReconcileError> {
        let mut feed = self.store.watch(&paths::updates(&self.base)).await?;
        while let Some(batch) = feed.recv().await {
            for event in batch {
                match event.kind {
                    FeedKind::Added | FeedKind::Modified => self.on_record(&event.doc.id, &event.doc),
                    FeedKind::Removed => self.index.forget(&event.doc.id),
                }
            }
        }
        log::debug!("Change feed for {} closed", self.base);
        Ok(())
    }

    fn on_record(&mut self, id: &str, doc: &crate::store::DocSnapshot) {
        if id == paths::SHUTDOWN_ID {
            if !self.shutdown_sent {
                self.shutdown_sent = true;
                log::info!("Shutdown sentinel observed for {}", self.base);
                let _ = self.shutdown_tx.send(());
            }
            return;
        }

        let parsed: UpdateId = match id.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Skipping update record with malformed id: {e}");
                return;
            }
        };

        // Records whose server timestamp has not settled yet come around
        // again as Modified once it has.
        let Some(created_at) = doc.create_time else {
            return;
        };
        self.index.record(id, created_at);

        if parsed.client == self.engine.client_id() {
            // Our own flush echoed back; the engine already has it.
            return;
        }

        let payload = match lz4_flex::decompress_size_prepended(&doc.data) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Skipping undecodable update record {id}: {e}");
                return;
            }
        };
        if let Err(e) = self.engine.apply_update(&payload, UpdateOrigin::Provider) {
            log::warn!("Skipping unappliable update record {id}: {e}");
        }
    }
}

#[derive(Debug)]
pub enum ReconcileError {
    Store(StoreError),
    Engine(EngineError),
    /// Stored payload failed to decompress.
    Corrupt(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error during reconcile: {e}"),
            Self::Engine(e) => write!(f, "Engine error during reconcile: {e}"),
            Self::Corrupt(e) => write!(f, "Corrupt stored payload: {e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<EngineError> for ReconcileError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}
