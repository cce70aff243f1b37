//! Peer transport collaborator.
//!
//! Signaling never interprets handshake payloads; it only relays the
//! opaque blobs a transport emits to the remote peer's store inbox and
//! feeds relayed blobs back in. The shapes here are the contract:
//!
//! ```text
//!   initiator open() ──▶ LinkEvent::Signal(offer) ──relay──▶ responder
//!   responder deliver_signal(offer) ──▶ Connected + Signal(answer)
//!   initiator deliver_signal(answer) ──▶ Connected
//! ```
//!
//! [`MemoryTransport`] implements the contract for links inside one
//! process. Its handshake blobs still travel through the signaling relay,
//! so mesh tests exercise the full store round trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events surfaced by one link attempt, in order: zero or more `Signal`s,
/// then `Connected`, then `Frame`s, then `Closed`.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Opaque handshake payload to relay to the remote peer.
    Signal(Vec<u8>),
    /// Handshake complete; `send` works from here on.
    Connected,
    /// A frame from the remote peer.
    Frame(Vec<u8>),
    /// Link torn down (remote close or transport failure).
    Closed,
}

/// Command surface of one link attempt.
pub trait PeerLink: Send + Sync + 'static {
    /// Send a frame to the remote peer. Fails until `Connected`.
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Feed a relayed handshake payload in. Malformed or stale payloads
    /// are logged and dropped.
    fn deliver_signal(&self, payload: &[u8]);

    /// Tear the link down, notifying the remote side.
    fn close(&self);
}

/// One direction of a link attempt: the command half plus its event stream.
pub struct PeerEndpoint {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Factory for link attempts. One instance is shared by every provider
/// that should be able to reach the others.
pub trait PeerTransport: Send + Sync + 'static {
    /// Open a link attempt from `local` toward `remote`. The initiator
    /// side emits the opening `Signal`; the responder side waits for it.
    fn open(&self, local: Uuid, remote: Uuid, initiator: bool) -> Result<PeerEndpoint, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum HandshakeStep {
    Offer,
    Answer,
}

/// The in-process transport's handshake blob. Opaque to everyone else.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Handshake {
    from: Uuid,
    step: HandshakeStep,
}

struct EndpointState {
    events: mpsc::UnboundedSender<LinkEvent>,
    connected: bool,
}

#[derive(Default)]
struct Registry {
    /// Keyed by (local, remote) so each direction of a pair has its own
    /// endpoint.
    endpoints: HashMap<(Uuid, Uuid), EndpointState>,
}

impl Registry {
    fn emit(&mut self, local: Uuid, remote: Uuid, event: LinkEvent) {
        if let Some(state) = self.endpoints.get(&(local, remote)) {
            let _ = state.events.send(event);
        }
    }
}

/// Same-process [`PeerTransport`]. Cheap to clone (shared registry).
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerTransport for MemoryTransport {
    fn open(&self, local: Uuid, remote: Uuid, initiator: bool) -> Result<PeerEndpoint, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut reg = self.registry.lock().expect("transport lock");
        reg.endpoints.insert((local, remote), EndpointState { events: events_tx.clone(), connected: false });

        if initiator {
            let offer = Handshake { from: local, step: HandshakeStep::Offer };
            let payload = bincode::serde::encode_to_vec(offer, bincode::config::standard())
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            let _ = events_tx.send(LinkEvent::Signal(payload));
        }

        Ok(PeerEndpoint {
            link: Arc::new(MemoryLink { registry: self.registry.clone(), local, remote }),
            events: events_rx,
        })
    }
}

struct MemoryLink {
    registry: Arc<Mutex<Registry>>,
    local: Uuid,
    remote: Uuid,
}

impl PeerLink for MemoryLink {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut reg = self.registry.lock().expect("transport lock");
        let connected = reg
            .endpoints
            .get(&(self.local, self.remote))
            .map(|s| s.connected)
            .unwrap_or(false);
        if !connected {
            return Err(TransportError::NotConnected);
        }
        match reg.endpoints.get(&(self.remote, self.local)) {
            Some(peer) if peer.events.send(LinkEvent::Frame(frame.to_vec())).is_ok() => Ok(()),
            _ => {
                reg.emit(self.local, self.remote, LinkEvent::Closed);
                Err(TransportError::Closed)
            }
        }
    }

    fn deliver_signal(&self, payload: &[u8]) {
        let handshake: Handshake =
            match bincode::serde::decode_from_slice(payload, bincode::config::standard()) {
                Ok((h, _)) => h,
                Err(e) => {
                    log::warn!("Dropping malformed handshake payload: {e}");
                    return;
                }
            };
        if handshake.from != self.remote {
            log::warn!(
                "Dropping handshake from {} on link to {}",
                handshake.from,
                self.remote
            );
            return;
        }

        let mut reg = self.registry.lock().expect("transport lock");
        match handshake.step {
            HandshakeStep::Offer => {
                // Responder side: the offerer must still be waiting.
                if !reg.endpoints.contains_key(&(self.remote, self.local)) {
                    log::debug!("Stale offer from {}, offerer gone", self.remote);
                    return;
                }
                if let Some(state) = reg.endpoints.get_mut(&(self.local, self.remote)) {
                    state.connected = true;
                }
                reg.emit(self.local, self.remote, LinkEvent::Connected);

                let answer = Handshake { from: self.local, step: HandshakeStep::Answer };
                match bincode::serde::encode_to_vec(answer, bincode::config::standard()) {
                    Ok(bytes) => reg.emit(self.local, self.remote, LinkEvent::Signal(bytes)),
                    Err(e) => log::warn!("Answer encode failed: {e}"),
                }
            }
            HandshakeStep::Answer => {
                if let Some(state) = reg.endpoints.get_mut(&(self.local, self.remote)) {
                    state.connected = true;
                }
                reg.emit(self.local, self.remote, LinkEvent::Connected);
            }
        }
    }

    fn close(&self) {
        let mut reg = self.registry.lock().expect("transport lock");
        if reg.endpoints.remove(&(self.local, self.remote)).is_some() {
            reg.emit(self.remote, self.local, LinkEvent::Closed);
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    /// `send` before the handshake completed.
    NotConnected,
    /// The remote endpoint is gone.
    Closed,
    Backend(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Link not connected"),
            Self::Closed => write!(f, "Link closed by remote"),
            Self::Backend(e) => write!(f, "Transport backend error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}
