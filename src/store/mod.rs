//! Document store boundary.
//!
//! The backend is an external collaborator: any per-document CRUD store
//! with per-collection change feeds, atomic multi-document transactions,
//! and a monotonic server-assigned timestamp on write satisfies
//! [`DocStore`]. The crate ships one implementation, [`MemoryStore`], for
//! tests and same-process deployments.
//!
//! Persisted layout relative to a document's base path:
//! ```text
//! <base>/history                                  — baseline record
//! <base>/history/updates/{id}                     — pending update blobs
//! <base>/history/updates/shutdown                 — shutdown sentinel
//! <base>/aware/announce/{peerId}                  — liveness beacons
//! <base>/aware/signal/{peerId}/sig_messages/{id}  — relayed handshakes
//! <base>/time                                     — transient clock probe
//! ```

pub mod memory;

pub use memory::MemoryStore;

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Milliseconds since the Unix epoch, in the store's clock domain.
pub type Millis = i64;

/// A stored document as observed through a read or a feed event.
#[derive(Debug, Clone, PartialEq)]
pub struct DocSnapshot {
    /// Last path segment (the document id within its collection).
    pub id: String,
    /// Opaque record body.
    pub data: Vec<u8>,
    /// Server-assigned creation time. `None` until the write commits.
    pub create_time: Option<Millis>,
    /// Server-assigned time of the last write.
    pub update_time: Option<Millis>,
}

/// Change-feed event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Added,
    Modified,
    Removed,
}

/// One change-feed event. Events arrive in commit order, batched; a batch
/// is processed to completion before the next is delivered.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub kind: FeedKind,
    pub doc: DocSnapshot,
}

/// Staged view used inside a transaction closure.
///
/// Reads observe the pre-transaction snapshot plus earlier staged writes;
/// nothing touches the store until the closure returns `Ok` and the whole
/// op set commits atomically.
pub struct TxView<'a> {
    snapshot: &'a HashMap<String, DocSnapshot>,
    staged: Vec<TxOp>,
}

#[derive(Debug, Clone)]
pub(crate) enum TxOp {
    Set { path: String, data: Vec<u8> },
    Delete { path: String },
}

impl<'a> TxView<'a> {
    pub(crate) fn new(snapshot: &'a HashMap<String, DocSnapshot>) -> Self {
        Self { snapshot, staged: Vec::new() }
    }

    /// Read a document at `path`, seeing earlier staged ops in this
    /// transaction.
    pub fn get(&self, path: &str) -> Option<DocSnapshot> {
        for op in self.staged.iter().rev() {
            match op {
                TxOp::Set { path: p, data } if p == path => {
                    return Some(DocSnapshot {
                        id: last_segment(path).to_string(),
                        data: data.clone(),
                        create_time: None,
                        update_time: None,
                    });
                }
                TxOp::Delete { path: p } if p == path => return None,
                _ => {}
            }
        }
        self.snapshot.get(path).cloned()
    }

    /// Stage a write.
    pub fn set(&mut self, path: &str, data: Vec<u8>) {
        self.staged.push(TxOp::Set { path: path.to_string(), data });
    }

    /// Stage a delete.
    pub fn delete(&mut self, path: &str) {
        self.staged.push(TxOp::Delete { path: path.to_string() });
    }

    pub(crate) fn into_ops(self) -> Vec<TxOp> {
        self.staged
    }
}

/// Transaction body. Runs synchronously against a [`TxView`]; returning
/// `Err` aborts with nothing applied.
pub type TxFn<'a> = Box<dyn FnOnce(&mut TxView<'_>) -> Result<(), StoreError> + Send + 'a>;

/// The document store collaborator.
///
/// Object-safe (methods return [`BoxFuture`]) so subsystems can share an
/// `Arc<dyn DocStore>`.
pub trait DocStore: Send + Sync + 'static {
    /// Read one document.
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<DocSnapshot>, StoreError>>;

    /// Create or overwrite a document. Returns the server-assigned write
    /// timestamp. Overwriting preserves the original creation time.
    fn set<'a>(&'a self, path: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<Millis, StoreError>>;

    /// Delete a document. Deleting a missing document is a no-op.
    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// List all documents directly under `collection`.
    fn list<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<DocSnapshot>, StoreError>>;

    /// Subscribe to the change feed of `collection`. The first batch
    /// reports every existing document as `Added`; later batches follow
    /// commit order. The receiver closing means the subscription ended.
    fn watch<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<Vec<FeedEvent>>, StoreError>>;

    /// Run an atomic read-modify-write transaction.
    fn transact<'a>(&'a self, f: TxFn<'a>) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Path layout helpers for the persisted document tree.
pub mod paths {
    use uuid::Uuid;

    /// Reserved update-record id signalling document teardown.
    pub const SHUTDOWN_ID: &str = "shutdown";

    pub fn baseline(base: &str) -> String {
        format!("{base}/history")
    }

    pub fn updates(base: &str) -> String {
        format!("{base}/history/updates")
    }

    pub fn update(base: &str, id: &str) -> String {
        format!("{base}/history/updates/{id}")
    }

    pub fn shutdown(base: &str) -> String {
        update(base, SHUTDOWN_ID)
    }

    pub fn announces(base: &str) -> String {
        format!("{base}/aware/announce")
    }

    pub fn announce(base: &str, peer: Uuid) -> String {
        format!("{base}/aware/announce/{peer}")
    }

    pub fn signals(base: &str, peer: Uuid) -> String {
        format!("{base}/aware/signal/{peer}/sig_messages")
    }

    pub fn signal(base: &str, peer: Uuid, msg_id: &str) -> String {
        format!("{base}/aware/signal/{peer}/sig_messages/{msg_id}")
    }

    pub fn time_probe(base: &str) -> String {
        format!("{base}/time")
    }
}

/// Last path segment of a document path.
pub(crate) fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (network, I/O, quota). Transient; retried by the
    /// next natural trigger, never automatically.
    Backend(String),
    /// Transaction aborted before commit.
    TxAborted(String),
    /// Record body could not be produced or understood.
    Serialization(String),
    /// A change-feed subscription ended unexpectedly.
    FeedClosed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "Store backend error: {e}"),
            Self::TxAborted(e) => write!(f, "Transaction aborted: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::FeedClosed => write!(f, "Change feed closed"),
        }
    }
}

impl std::error::Error for StoreError {}
