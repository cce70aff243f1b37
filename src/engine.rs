//! Replicated-document engine boundary.
//!
//! The merge algorithm itself lives outside this crate: anything whose
//! binary updates merge associatively, commutatively, and idempotently can
//! implement [`Engine`]. The shipped adapter is [`YrsEngine`], wrapping a
//! `yrs::Doc`.
//!
//! Updates the provider applies carry the provider origin tag so the
//! batcher can tell remote echoes apart from genuine local edits and never
//! re-batches its own writes.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

/// Transaction origin tag for provider-applied updates.
pub const PROVIDER_ORIGIN: &str = "meshdoc";

/// Where an update came from, as seen by the local-change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Applied by this provider (baseline load or remote update). Skipped
    /// by the batcher.
    Provider,
    /// A genuine local edit (or any third-party apply). Batched.
    External,
}

/// One document change observed on the local engine.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub update: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// The replicated-document engine collaborator.
pub trait Engine: Send + Sync + 'static {
    /// Stable identifier of this replica's engine client.
    fn client_id(&self) -> u64;

    /// Apply a binary update. Re-applying already-seen data is a no-op.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), EngineError>;

    /// Merge update blobs into one equivalent blob. Stateless;
    /// associative, commutative, and idempotent over already-seen data.
    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError>;

    /// Encode the full current document state as a single update blob.
    fn encode_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Take the local-change stream. Yields every applied update with its
    /// origin tag. Can only be taken once.
    fn take_changes(&self) -> Option<mpsc::UnboundedReceiver<LocalChange>>;
}

/// Keeps the update observer registered for the engine's lifetime.
///
/// `yrs::Subscription` is not `Send`/`Sync` on its own, which would bar
/// [`YrsEngine`] from crossing task boundaries. The subscription here is
/// only ever dropped, never invoked, and the callback it unregisters
/// captures nothing but an `UnboundedSender` and a `yrs::Origin`, both of
/// which are `Send + Sync`. Unregistration itself goes through the
/// observer registry of the wrapped `yrs::Doc`, which is `Sync`.
struct ObserverHandle {
    _sub: yrs::Subscription,
}

unsafe impl Send for ObserverHandle {}
unsafe impl Sync for ObserverHandle {}

/// `yrs`-backed engine.
pub struct YrsEngine {
    doc: yrs::Doc,
    changes: Mutex<Option<mpsc::UnboundedReceiver<LocalChange>>>,
    _observer: ObserverHandle,
}

impl YrsEngine {
    /// Wrap a document, installing the update observer.
    pub fn new(doc: yrs::Doc) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let self_origin = yrs::Origin::from(PROVIDER_ORIGIN);
        let sub = doc
            .observe_update_v1(move |txn, event| {
                let origin = if txn.origin() == Some(&self_origin) {
                    UpdateOrigin::Provider
                } else {
                    UpdateOrigin::External
                };
                let _ = tx.send(LocalChange { update: event.update.clone(), origin });
            })
            .map_err(|e| EngineError::Observe(e.to_string()))?;
        Ok(Self {
            doc,
            changes: Mutex::new(Some(rx)),
            _observer: ObserverHandle { _sub: sub },
        })
    }

    /// The wrapped document.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }
}

impl Engine for YrsEngine {
    fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), EngineError> {
        let decoded = yrs::Update::decode_v1(update).map_err(|e| EngineError::Apply(e.to_string()))?;
        let mut txn = match origin {
            UpdateOrigin::Provider => self.doc.transact_mut_with(PROVIDER_ORIGIN),
            UpdateOrigin::External => self.doc.transact_mut(),
        };
        txn.apply_update(decoded).map_err(|e| EngineError::Apply(e.to_string()))
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        let mut decoded = Vec::with_capacity(updates.len());
        for update in updates {
            decoded.push(
                yrs::Update::decode_v1(update).map_err(|e| EngineError::Merge(e.to_string()))?,
            );
        }
        Ok(yrs::Update::merge_updates(decoded).encode_v1())
    }

    fn encode_state(&self) -> Result<Vec<u8>, EngineError> {
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&yrs::StateVector::default()))
    }

    fn take_changes(&self) -> Option<mpsc::UnboundedReceiver<LocalChange>> {
        self.changes.lock().expect("engine lock").take()
    }
}

/// Engine errors.
#[derive(Debug, Clone)]
pub enum EngineError {
    Apply(String),
    Merge(String),
    Encode(String),
    Observe(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply(e) => write!(f, "Apply error: {e}"),
            Self::Merge(e) => write!(f, "Merge error: {e}"),
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Observe(e) => write!(f, "Observer error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn text_update(content: &str) -> (YrsEngine, Vec<u8>) {
        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        let mut rx = engine.take_changes().unwrap();
        {
            let mut txn = engine.doc().transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, content);
        }
        let change = rx.try_recv().unwrap();
        (engine, change.update)
    }

    fn read_text(engine: &YrsEngine) -> String {
        let txn = engine.doc().transact();
        txn.get_text("t").map(|t| t.get_string(&txn)).unwrap_or_default()
    }

    #[test]
    fn test_local_edit_tagged_external() {
        let (_, update) = text_update("hi");
        assert!(!update.is_empty());
    }

    #[test]
    fn test_provider_apply_tagged_provider() {
        let (_, update) = text_update("hi");

        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        let mut rx = engine.take_changes().unwrap();
        engine.apply_update(&update, UpdateOrigin::Provider).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.origin, UpdateOrigin::Provider);
        assert_eq!(read_text(&engine), "hi");
    }

    #[test]
    fn test_apply_idempotent() {
        let (_, update) = text_update("once");

        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        engine.apply_update(&update, UpdateOrigin::Provider).unwrap();
        engine.apply_update(&update, UpdateOrigin::Provider).unwrap();
        assert_eq!(read_text(&engine), "once");
    }

    #[test]
    fn test_merge_updates_combines() {
        let (_, u1) = text_update("a");
        let (_, u2) = text_update("b");

        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        let merged = engine.merge_updates(&[u1, u2]).unwrap();
        engine.apply_update(&merged, UpdateOrigin::Provider).unwrap();

        let text = read_text(&engine);
        assert_eq!(text.len(), 2);
        assert!(text.contains('a') && text.contains('b'));
    }

    #[test]
    fn test_merge_rejects_garbage() {
        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        assert!(engine.merge_updates(&[vec![0xFF, 0x00, 0x13]]).is_err());
    }

    #[test]
    fn test_encode_state_roundtrip() {
        let (engine, _) = text_update("state");
        let state = engine.encode_state().unwrap();

        let fresh = YrsEngine::new(yrs::Doc::new()).unwrap();
        fresh.apply_update(&state, UpdateOrigin::Provider).unwrap();
        assert_eq!(read_text(&fresh), "state");
    }

    #[tokio::test]
    async fn test_engine_shared_across_tasks() {
        let (_, update) = text_update("moved");

        let engine = std::sync::Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
        let worker = std::sync::Arc::clone(&engine);
        tokio::spawn(async move {
            worker.apply_update(&update, UpdateOrigin::Provider).unwrap();
        })
        .await
        .unwrap();

        assert_eq!(read_text(&engine), "moved");
    }

    #[test]
    fn test_take_changes_once() {
        let engine = YrsEngine::new(yrs::Doc::new()).unwrap();
        assert!(engine.take_changes().is_some());
        assert!(engine.take_changes().is_none());
    }
}
