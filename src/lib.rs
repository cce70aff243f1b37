//! # meshdoc — serverless real-time document sync
//!
//! Keeps replicas of a CRDT document converged through any serverless
//! document store, with a peer mesh layered on top for low-latency
//! awareness traffic. No sync server: the store is the rendezvous.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    update records     ┌──────────────┐
//! │ DocProvider  │ ◄───────────────────► │  doc store   │
//! │  (replica A) │    announce/signal    │ (history +   │
//! └──────┬───────┘ ◄───────────────────► │  mesh lobby) │
//!        │                               └──────┬───────┘
//!        │ peer links (awareness)               │
//!        ▼                               ┌──────┴───────┐
//! ┌──────────────┐                       │ DocProvider  │
//! │  Yrs Doc     │ ◄───────────────────► │  (replica B) │
//! │  (engine)    │                       └──────────────┘
//! └──────────────┘
//! ```
//!
//! Edits flow store-first: the batcher coalesces local deltas into update
//! records, every replica's reconciler applies them off the change feed,
//! and the compactor periodically folds stale records into a baseline so
//! history stays bounded. The peer mesh (signaling + room) carries only
//! presence, discovered through announce beacons in the same store.
//!
//! ## Modules
//!
//! - [`store`] — document-store boundary trait plus the in-process backend
//! - [`engine`] — replicated-document engine boundary over yrs
//! - [`protocol`] — binary framing for room traffic and stored records
//! - [`batcher`] — local-update coalescing and flush
//! - [`reconciler`] — change-feed replay into the engine
//! - [`compactor`] — transactional history folding
//! - [`clock`] — server-clock offset estimation
//! - [`context`] — process-scoped shared state (clock memo, room registry)
//! - [`signaling`] — store-mediated peer discovery and handshake relay
//! - [`transport`] — peer-link boundary plus the in-process transport
//! - [`room`] — peer group, awareness, same-process bus membership
//! - [`bus`] — named broadcast channels for same-process peers
//! - [`crypto`] — room-key derivation and payload sealing
//! - [`provider`] — the facade binding one document to one store path

pub mod batcher;
pub mod bus;
pub mod clock;
pub mod compactor;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod protocol;
pub mod provider;
pub mod reconciler;
pub mod room;
pub mod signaling;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use bus::LocalBus;
pub use clock::ClockSync;
pub use context::SyncContext;
pub use crypto::{CryptoError, PayloadCipher, Plaintext, RoomKey};
pub use engine::{Engine, EngineError, LocalChange, UpdateOrigin, YrsEngine};
pub use protocol::{AnnounceMsg, AwarenessEntry, ProtocolError, RoomMessage, SignalMsg, UpdateId};
pub use provider::{DocOptions, DocProvider, ProviderConfig, ProviderEvent, SyncError};
pub use reconciler::{ChangeFeedReconciler, ObservedIndex, ReconcileError};
pub use room::{DeliveryChannel, Room, RoomConfig, RoomEvent, RoomStats};
pub use signaling::{MeshConfig, PeerMeshSignaling};
pub use store::{DocSnapshot, DocStore, FeedEvent, FeedKind, MemoryStore, Millis, StoreError};
pub use transport::{LinkEvent, MemoryTransport, PeerEndpoint, PeerLink, PeerTransport, TransportError};
