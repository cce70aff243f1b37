//! Room protocol.
//!
//! A room is one document's live peer group. It owns the peer-link table,
//! the awareness (presence) state, and the same-process bus membership,
//! and speaks [`RoomMessage`] over both delivery channels:
//!
//! ```text
//!               ┌────────── Room ──────────┐
//!   peer links ─┤ conns (transport frames) ├─ local bus (broadcast)
//!               │ awareness  (LWW entries) │
//!               └──────────────────────────┘
//! ```
//!
//! Every frame is sealed under the room key before it leaves, so two
//! rooms sharing a name but not a password never read each other's
//! traffic. The aggregate `synced` flag holds while someone is present
//! (a peer link or a bus peer) and every open link has finished its
//! handshake; transitions are reported once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::bus::LocalBus;
use crate::crypto::{open, seal, CryptoError, PayloadCipher, RoomKey};
use crate::protocol::{AwarenessEntry, BusFrame, RoomMessage};
use crate::transport::{LinkEvent, PeerEndpoint, PeerLink, PeerTransport, TransportError};

/// Where an inbound message arrived from, and where a reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    Peer(Uuid),
    Bus,
}

/// Room lifecycle notifications, surfaced through the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Aggregate synced flag flipped. Emitted on transitions only.
    Synced(bool),
    /// A peer connected, disconnected, or joined/left the bus.
    PeersChanged,
    /// Remote awareness state changed.
    AwarenessChanged,
}

/// A handshake payload the signaling layer must relay to `to`.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub to: Uuid,
    pub payload: Vec<u8>,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub connected_peers: usize,
    pub connecting_peers: usize,
    pub bus_peers: usize,
    pub awareness_entries: usize,
    pub synced: bool,
}

struct PeerConnection {
    link: Arc<dyn PeerLink>,
    initiator: bool,
    connected: bool,
    /// At least one room message received over this link.
    synced: bool,
    opened_at: Instant,
}

/// Last-writer-wins awareness table. Tombstones (state `None`) are kept so
/// a late lower-clock update cannot resurrect a withdrawn entry.
struct AwarenessStore {
    local: AwarenessEntry,
    peers: HashMap<u64, AwarenessEntry>,
}

impl AwarenessStore {
    fn new(client_id: u64) -> Self {
        Self {
            local: AwarenessEntry { client_id, clock: 0, state: None },
            peers: HashMap::new(),
        }
    }

    /// Apply remote entries; returns true when anything changed.
    fn apply(&mut self, entries: &[AwarenessEntry]) -> bool {
        let mut changed = false;
        for entry in entries {
            if entry.client_id == self.local.client_id {
                continue;
            }
            match self.peers.get(&entry.client_id) {
                Some(existing) if existing.clock >= entry.clock => {}
                _ => {
                    self.peers.insert(entry.client_id, entry.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    fn bump_local(&mut self, state: Option<Vec<u8>>) -> AwarenessEntry {
        self.local.clock += 1;
        self.local.state = state;
        self.local.clone()
    }

    /// Everything known, own slot included, tombstones too.
    fn snapshot(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self.peers.values().cloned().collect();
        entries.push(self.local.clone());
        entries
    }

    fn live_count(&self) -> usize {
        let peers = self.peers.values().filter(|e| e.state.is_some()).count();
        peers + usize::from(self.local.state.is_some())
    }
}

pub struct RoomConfig {
    /// This replica's mesh identity.
    pub peer_id: Uuid,
    /// Bus channel name; the document base path.
    pub name: String,
    /// Engine client id, used as the awareness slot owner.
    pub client_id: u64,
    pub awareness_enabled: bool,
    pub key: Option<RoomKey>,
}

pub struct Room {
    cfg: RoomConfig,
    transport: Arc<dyn PeerTransport>,
    cipher: Arc<dyn PayloadCipher>,
    bus: Option<Arc<LocalBus>>,
    conns: RwLock<HashMap<Uuid, PeerConnection>>,
    bus_peers: Mutex<HashSet<Uuid>>,
    awareness: Mutex<AwarenessStore>,
    signal_out: mpsc::UnboundedSender<OutboundSignal>,
    events: mpsc::UnboundedSender<RoomEvent>,
    synced: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Room {
    pub fn new(
        cfg: RoomConfig,
        transport: Arc<dyn PeerTransport>,
        cipher: Arc<dyn PayloadCipher>,
        bus: Option<Arc<LocalBus>>,
        signal_out: mpsc::UnboundedSender<OutboundSignal>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Arc<Self> {
        let client_id = cfg.client_id;
        Arc::new(Self {
            cfg,
            transport,
            cipher,
            bus,
            conns: RwLock::new(HashMap::new()),
            bus_peers: Mutex::new(HashSet::new()),
            awareness: Mutex::new(AwarenessStore::new(client_id)),
            signal_out,
            events,
            synced: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.cfg.peer_id
    }

    /// Announce on the process-local bus and start consuming its frames.
    pub async fn join_bus(self: &Arc<Self>) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let mut rx = bus.subscribe(&self.cfg.name).await;
        let room = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => room.handle_bus_frame(&frame).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Bus subscriber lagged, {n} frame(s) dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().expect("room lock").push(handle);
        self.publish_bus(RoomMessage::BusPeerAnnounce { peer_id: self.cfg.peer_id }).await;
    }

    /// Open a link attempt toward `remote`. No-op when one already exists.
    pub async fn open_link(self: &Arc<Self>, remote: Uuid, initiator: bool) -> Result<(), TransportError> {
        {
            let conns = self.conns.read().await;
            if conns.contains_key(&remote) {
                return Ok(());
            }
        }
        let PeerEndpoint { link, events } = self.transport.open(self.cfg.peer_id, remote, initiator)?;
        {
            let mut conns = self.conns.write().await;
            if conns.contains_key(&remote) {
                link.close();
                return Ok(());
            }
            conns.insert(
                remote,
                PeerConnection { link, initiator, connected: false, synced: false, opened_at: Instant::now() },
            );
        }

        let room = self.clone();
        let handle = tokio::spawn(room.pump_link(remote, events));
        self.tasks.lock().expect("room lock").push(handle);
        Ok(())
    }

    /// Feed a relayed handshake payload to the link for `from`, opening a
    /// responder link on first contact.
    pub async fn deliver_signal(self: &Arc<Self>, from: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        self.open_link(from, false).await?;
        let conns = self.conns.read().await;
        if let Some(conn) = conns.get(&from) {
            conn.link.deliver_signal(payload);
        }
        Ok(())
    }

    async fn pump_link(self: Arc<Self>, remote: Uuid, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Signal(payload) => {
                    let _ = self.signal_out.send(OutboundSignal { to: remote, payload });
                }
                LinkEvent::Connected => self.on_link_connected(remote).await,
                LinkEvent::Frame(frame) => self.handle_peer_frame(remote, &frame).await,
                LinkEvent::Closed => break,
            }
        }
        self.drop_conn(remote).await;
    }

    async fn on_link_connected(&self, remote: Uuid) {
        {
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&remote) else {
                return;
            };
            conn.connected = true;
            if !self.cfg.awareness_enabled {
                // No room traffic expected; the link itself is the sync.
                conn.synced = true;
            }
        }
        let _ = self.events.send(RoomEvent::PeersChanged);
        self.recompute_synced().await;

        if self.cfg.awareness_enabled {
            let query = RoomMessage::AwarenessQuery { from: self.cfg.client_id };
            self.send_to(DeliveryChannel::Peer(remote), &query).await;
        }
    }

    async fn handle_peer_frame(self: &Arc<Self>, remote: Uuid, sealed: &[u8]) {
        let plain = match open(self.cfg.key.as_ref(), self.cipher.as_ref(), sealed) {
            Ok(plain) => plain,
            Err(CryptoError::KeyMismatch) => {
                log::debug!("Dropping frame from {remote}: wrong room key");
                return;
            }
            Err(e) => {
                log::warn!("Dropping undecodable frame from {remote}: {e}");
                return;
            }
        };
        let msg = match RoomMessage::decode(&plain) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame from {remote}: {e}");
                return;
            }
        };

        let first = {
            let mut conns = self.conns.write().await;
            match conns.get_mut(&remote) {
                Some(conn) if !conn.synced => {
                    conn.synced = true;
                    true
                }
                _ => false,
            }
        };
        if first {
            self.recompute_synced().await;
        }
        self.handle_message(DeliveryChannel::Peer(remote), msg).await;
    }

    async fn handle_bus_frame(self: &Arc<Self>, sealed: &[u8]) {
        let plain = match open(self.cfg.key.as_ref(), self.cipher.as_ref(), sealed) {
            Ok(plain) => plain,
            Err(CryptoError::KeyMismatch) => return,
            Err(e) => {
                log::warn!("Dropping undecodable bus frame: {e}");
                return;
            }
        };
        let frame = match BusFrame::decode(&plain) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed bus frame: {e}");
                return;
            }
        };
        if frame.from == self.cfg.peer_id {
            return;
        }
        self.handle_message(DeliveryChannel::Bus, frame.msg).await;
    }

    async fn handle_message(self: &Arc<Self>, source: DeliveryChannel, msg: RoomMessage) {
        match msg {
            RoomMessage::AwarenessQuery { .. } => {
                if !self.cfg.awareness_enabled {
                    return;
                }
                let entries = self.awareness.lock().expect("room lock").snapshot();
                // Reply to the asker only, never fanned out.
                self.send_to(source, &RoomMessage::AwarenessUpdate { entries }).await;
            }
            RoomMessage::AwarenessUpdate { entries } => {
                if !self.cfg.awareness_enabled {
                    return;
                }
                let changed = self.awareness.lock().expect("room lock").apply(&entries);
                if changed {
                    let _ = self.events.send(RoomEvent::AwarenessChanged);
                }
            }
            RoomMessage::BusPeerAnnounce { peer_id } => {
                let newcomer = self.bus_peers.lock().expect("room lock").insert(peer_id);
                if newcomer {
                    let _ = self.events.send(RoomEvent::PeersChanged);
                    self.recompute_synced().await;
                    // Introduce ourselves back so the newcomer learns us too.
                    self.publish_bus(RoomMessage::BusPeerAnnounce { peer_id: self.cfg.peer_id }).await;
                }
            }
            RoomMessage::BusPeerWithdraw { peer_id } => {
                let removed = self.bus_peers.lock().expect("room lock").remove(&peer_id);
                if removed {
                    let _ = self.events.send(RoomEvent::PeersChanged);
                    self.recompute_synced().await;
                }
            }
        }
    }

    /// Replace the local awareness slot and fan the change out everywhere.
    pub async fn set_local_awareness(&self, state: Option<Vec<u8>>) {
        if !self.cfg.awareness_enabled {
            return;
        }
        let entry = self.awareness.lock().expect("room lock").bump_local(state);
        self.broadcast(&RoomMessage::AwarenessUpdate { entries: vec![entry] }).await;
    }

    /// Remote awareness entries currently live (tombstones excluded).
    pub fn awareness_entries(&self) -> Vec<AwarenessEntry> {
        self.awareness
            .lock()
            .expect("room lock")
            .peers
            .values()
            .filter(|e| e.state.is_some())
            .cloned()
            .collect()
    }

    async fn send_to(&self, channel: DeliveryChannel, msg: &RoomMessage) {
        match channel {
            DeliveryChannel::Peer(remote) => {
                let sealed = match self.seal_msg(msg) {
                    Some(sealed) => sealed,
                    None => return,
                };
                let conns = self.conns.read().await;
                if let Some(conn) = conns.get(&remote) {
                    if let Err(e) = conn.link.send(&sealed) {
                        log::debug!("Send to {remote} failed: {e}");
                    }
                }
            }
            DeliveryChannel::Bus => self.publish_bus(msg.clone()).await,
        }
    }

    /// Send to every connected peer and the bus.
    async fn broadcast(&self, msg: &RoomMessage) {
        if let Some(sealed) = self.seal_msg(msg) {
            let conns = self.conns.read().await;
            for (remote, conn) in conns.iter() {
                if !conn.connected {
                    continue;
                }
                if let Err(e) = conn.link.send(&sealed) {
                    log::debug!("Broadcast to {remote} failed: {e}");
                }
            }
        }
        self.publish_bus(msg.clone()).await;
    }

    async fn publish_bus(&self, msg: RoomMessage) {
        let Some(bus) = &self.bus else {
            return;
        };
        let frame = BusFrame::new(self.cfg.peer_id, msg);
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Bus frame encode failed: {e}");
                return;
            }
        };
        match seal(self.cfg.key.as_ref(), self.cipher.as_ref(), &encoded) {
            Ok(sealed) => {
                bus.publish(&self.cfg.name, Arc::new(sealed)).await;
            }
            Err(e) => log::warn!("Bus frame seal failed: {e}"),
        }
    }

    fn seal_msg(&self, msg: &RoomMessage) -> Option<Vec<u8>> {
        let encoded = match msg.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Frame encode failed: {e}");
                return None;
            }
        };
        match seal(self.cfg.key.as_ref(), self.cipher.as_ref(), &encoded) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                log::warn!("Frame seal failed: {e}");
                None
            }
        }
    }

    /// Tear one connection down. Returns true when it existed.
    pub async fn drop_conn(&self, remote: Uuid) -> bool {
        let removed = self.conns.write().await.remove(&remote);
        match removed {
            Some(conn) => {
                conn.link.close();
                let _ = self.events.send(RoomEvent::PeersChanged);
                self.recompute_synced().await;
                true
            }
            None => false,
        }
    }

    /// Peers whose handshake has been running longer than `timeout`.
    pub async fn connecting_longer_than(&self, timeout: Duration) -> Vec<Uuid> {
        let conns = self.conns.read().await;
        conns
            .iter()
            .filter(|(_, c)| !c.connected && c.opened_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn conn_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn has_conn(&self, remote: Uuid) -> bool {
        self.conns.read().await.contains_key(&remote)
    }

    pub async fn stats(&self) -> RoomStats {
        let conns = self.conns.read().await;
        let connected = conns.values().filter(|c| c.connected).count();
        RoomStats {
            connected_peers: connected,
            connecting_peers: conns.len() - connected,
            bus_peers: self.bus_peers.lock().expect("room lock").len(),
            awareness_entries: self.awareness.lock().expect("room lock").live_count(),
            synced: self.synced.load(Ordering::SeqCst),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn recompute_synced(&self) {
        let (has_conns, all_synced) = {
            let conns = self.conns.read().await;
            (!conns.is_empty(), conns.values().all(|c| c.synced))
        };
        let present = has_conns || !self.bus_peers.lock().expect("room lock").is_empty();
        let now = present && all_synced;
        if self.synced.swap(now, Ordering::SeqCst) != now {
            let _ = self.events.send(RoomEvent::Synced(now));
        }
    }

    /// Withdraw from the bus, close every link, stop every pump task.
    pub async fn leave(&self) {
        self.publish_bus(RoomMessage::BusPeerWithdraw { peer_id: self.cfg.peer_id }).await;
        {
            let mut conns = self.conns.write().await;
            for (_, conn) in conns.drain() {
                conn.link.close();
            }
        }
        for task in self.tasks.lock().expect("room lock").drain(..) {
            task.abort();
        }
    }
}
