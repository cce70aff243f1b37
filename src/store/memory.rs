//! In-process document store backend.
//!
//! Implements the full [`DocStore`] contract — commit-ordered change-feed
//! batches, atomic transactions, monotonic server timestamps — against a
//! plain map. Serves tests and same-process meshes; a real deployment
//! points the provider at a serverless backend instead.
//!
//! The server clock reads `tokio::time::Instant`, so tests running under
//! `tokio::time::pause()` can age records deterministically. A configurable
//! skew offsets the server clock from local time for clock-sync tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::{last_segment, DocSnapshot, DocStore, FeedEvent, FeedKind, Millis, StoreError, TxFn, TxOp, TxView};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    create_time: Millis,
    update_time: Millis,
}

struct Watcher {
    collection: String,
    tx: mpsc::UnboundedSender<Vec<FeedEvent>>,
}

struct Inner {
    docs: HashMap<String, StoredEntry>,
    watchers: Vec<Watcher>,
    base_ms: Millis,
    epoch: tokio::time::Instant,
    skew_ms: Millis,
    last_ts: Millis,
    fail_next_tx: bool,
    fail_next_set: bool,
    fail_next_watch: bool,
}

impl Inner {
    /// Server-assigned timestamp: skewed wall base plus tokio-clock elapsed,
    /// clamped monotonic.
    fn server_now(&mut self) -> Millis {
        let elapsed = self.epoch.elapsed().as_millis() as Millis;
        let mut now = self.base_ms + self.skew_ms + elapsed;
        if now <= self.last_ts {
            now = self.last_ts + 1;
        }
        self.last_ts = now;
        now
    }

    fn snapshot_of(&self, entry: &StoredEntry, path: &str) -> DocSnapshot {
        DocSnapshot {
            id: last_segment(path).to_string(),
            data: entry.data.clone(),
            create_time: Some(entry.create_time),
            update_time: Some(entry.update_time),
        }
    }

    /// Fan one commit batch out to the watchers of each touched collection.
    fn notify(&mut self, events: Vec<(String, FeedEvent)>) {
        if events.is_empty() {
            return;
        }
        let mut per_collection: HashMap<&str, Vec<FeedEvent>> = HashMap::new();
        for (collection, ev) in &events {
            per_collection.entry(collection.as_str()).or_default().push(ev.clone());
        }
        self.watchers.retain(|w| {
            match per_collection.get(w.collection.as_str()) {
                Some(batch) => w.tx.send(batch.clone()).is_ok(),
                None => !w.tx.is_closed(),
            }
        });
    }

    fn apply_set(&mut self, path: &str, data: Vec<u8>) -> (Millis, FeedEvent) {
        let now = self.server_now();
        let (entry, kind) = match self.docs.get(path) {
            Some(existing) => (
                StoredEntry {
                    data,
                    create_time: existing.create_time,
                    update_time: now,
                },
                FeedKind::Modified,
            ),
            None => (
                StoredEntry { data, create_time: now, update_time: now },
                FeedKind::Added,
            ),
        };
        let snap = self.snapshot_of(&entry, path);
        self.docs.insert(path.to_string(), entry);
        (now, FeedEvent { kind, doc: snap })
    }

    fn apply_delete(&mut self, path: &str) -> Option<FeedEvent> {
        let entry = self.docs.remove(path)?;
        let snap = self.snapshot_of(&entry, path);
        Some(FeedEvent { kind: FeedKind::Removed, doc: snap })
    }
}

/// Map-backed [`DocStore`]. Cheap to clone (shared interior).
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock_skew(0)
    }

    /// Create a store whose server clock runs `skew_ms` ahead of (or, when
    /// negative, behind) the local clock.
    pub fn with_clock_skew(skew_ms: Millis) -> Self {
        let base_ms = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Millis;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                docs: HashMap::new(),
                watchers: Vec::new(),
                base_ms,
                epoch: tokio::time::Instant::now(),
                skew_ms,
                last_ts: 0,
                fail_next_tx: false,
                fail_next_set: false,
                fail_next_watch: false,
            })),
        }
    }

    /// Make the next `transact` call fail with `TxAborted`, committing
    /// nothing. Subsequent transactions behave normally.
    pub fn fail_next_transaction(&self) {
        self.inner.lock().expect("store lock").fail_next_tx = true;
    }

    /// Make the next `set` call fail with a backend error, writing nothing.
    pub fn fail_next_set(&self) {
        self.inner.lock().expect("store lock").fail_next_set = true;
    }

    /// Make the next `watch` call fail with a backend error, registering
    /// nothing.
    pub fn fail_next_watch(&self) {
        self.inner.lock().expect("store lock").fail_next_watch = true;
    }

    /// Number of documents currently stored.
    pub fn doc_count(&self) -> usize {
        self.inner.lock().expect("store lock").docs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocStore for MemoryStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<DocSnapshot>, StoreError>> {
        Box::pin(async move {
            let inner = self.lock();
            Ok(inner.docs.get(path).map(|e| inner.snapshot_of(e, path)))
        })
    }

    fn set<'a>(&'a self, path: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<Millis, StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if inner.fail_next_set {
                inner.fail_next_set = false;
                return Err(StoreError::Backend("injected write failure".into()));
            }
            let (ts, event) = inner.apply_set(path, data);
            let collection = parent_collection(path);
            inner.notify(vec![(collection, event)]);
            Ok(ts)
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(event) = inner.apply_delete(path) {
                let collection = parent_collection(path);
                inner.notify(vec![(collection, event)]);
            }
            Ok(())
        })
    }

    fn list<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<DocSnapshot>, StoreError>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut docs: Vec<DocSnapshot> = inner
                .docs
                .iter()
                .filter(|(path, _)| in_collection(path, collection))
                .map(|(path, e)| inner.snapshot_of(e, path))
                .collect();
            docs.sort_by(|a, b| a.create_time.cmp(&b.create_time));
            Ok(docs)
        })
    }

    fn watch<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<Vec<FeedEvent>>, StoreError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut inner = self.lock();
            if inner.fail_next_watch {
                inner.fail_next_watch = false;
                return Err(StoreError::Backend("injected watch failure".into()));
            }

            // Initial snapshot: every existing document as Added, in
            // creation order, delivered as one batch.
            let mut initial: Vec<FeedEvent> = inner
                .docs
                .iter()
                .filter(|(path, _)| in_collection(path, collection))
                .map(|(path, e)| FeedEvent {
                    kind: FeedKind::Added,
                    doc: inner.snapshot_of(e, path),
                })
                .collect();
            initial.sort_by(|a, b| a.doc.create_time.cmp(&b.doc.create_time));
            if !initial.is_empty() {
                let _ = tx.send(initial);
            }

            inner.watchers.push(Watcher { collection: collection.to_string(), tx });
            Ok(rx)
        })
    }

    fn transact<'a>(&'a self, f: TxFn<'a>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if inner.fail_next_tx {
                inner.fail_next_tx = false;
                return Err(StoreError::TxAborted("injected failure".into()));
            }

            let snapshot: HashMap<String, DocSnapshot> = inner
                .docs
                .iter()
                .map(|(path, e)| (path.clone(), inner.snapshot_of(e, path)))
                .collect();

            let mut view = TxView::new(&snapshot);
            f(&mut view)?;
            let ops = view.into_ops();

            // Commit the whole op set, then notify as one ordered batch.
            let mut events = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    TxOp::Set { path, data } => {
                        let (_, ev) = inner.apply_set(&path, data);
                        events.push((parent_collection(&path), ev));
                    }
                    TxOp::Delete { path } => {
                        if let Some(ev) = inner.apply_delete(&path) {
                            events.push((parent_collection(&path), ev));
                        }
                    }
                }
            }
            inner.notify(events);
            Ok(())
        })
    }
}

/// Collection a document path belongs to (everything before the last `/`).
fn parent_collection(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// A path is in a collection when it is exactly one segment below it.
fn in_collection(path: &str, collection: &str) -> bool {
    match path.strip_prefix(collection) {
        Some(rest) => rest.starts_with('/') && !rest[1..].contains('/'),
        None => false,
    }
}
