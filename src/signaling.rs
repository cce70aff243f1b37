//! Peer-mesh signaling over the document store.
//!
//! Peers have no rendezvous server; the store itself is the lobby. Each
//! peer keeps a liveness beacon in the announce collection and an inbox
//! of relayed handshake blobs in the signal collection:
//!
//! ```text
//!   announce/{peer}                  ── who is here (refreshed, TTL'd)
//!   signal/{peer}/sig_messages/{id}  ── handshake blobs, consumed on read
//! ```
//!
//! Discovery follows the announce feed. For every live peer the tie-break
//! rule picks exactly one initiator — the later announcer, ties to the
//! larger id — so both sides never offer at once. Peers seen while the
//! link table is full stay on the known list and get an offer once a slot
//! frees. Outbound handshake payloads from the room's links are written
//! into the remote inbox; inbox records are deleted as they are consumed.
//!
//! A peer that announces but never completes its handshake within the
//! connect timeout is presumed dead: its beacon and the blobs we sent it
//! are deleted and the half-open link is dropped.
//!
//! Announce and signal bodies are sealed under the room key, so a
//! password-protected room ignores beacons from strangers sharing the
//! same document path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::clock::ClockSync;
use crate::context::SyncContext;
use crate::crypto::{open, seal, CryptoError, PayloadCipher, RoomKey};
use crate::protocol::{AnnounceMsg, SignalMsg};
use crate::room::{OutboundSignal, Room};
use crate::store::{paths, DocStore, FeedKind, Millis, StoreError};

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Peer-link ceiling; announces beyond it are ignored until a slot
    /// frees up.
    pub max_conns: usize,
    /// Handshake deadline before a peer is presumed dead.
    pub connect_timeout: Duration,
    /// Beacon re-publish interval. Kept under the TTL.
    pub announce_refresh: Duration,
    /// Beacons older than this are garbage, removed on sight.
    pub announce_ttl: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_conns: 20,
            connect_timeout: Duration::from_secs(5),
            announce_refresh: Duration::from_secs(23 * 60 * 60),
            announce_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The initiator of a pair is the later announcer; ties go to the larger
/// peer id. Both sides evaluate this to opposite answers, so exactly one
/// offers.
fn initiates(own: (Millis, Uuid), other: (Millis, Uuid)) -> bool {
    own > other
}

pub struct PeerMeshSignaling {
    store: Arc<dyn DocStore>,
    room: Arc<Room>,
    clock: ClockSync,
    base: String,
    peer_id: Uuid,
    key: Option<RoomKey>,
    cipher: Arc<dyn PayloadCipher>,
    cfg: MeshConfig,
    /// Inbox records we wrote per remote, cleaned up on eviction.
    sent: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl PeerMeshSignaling {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocStore>,
        room: Arc<Room>,
        ctx: Arc<SyncContext>,
        base: String,
        key: Option<RoomKey>,
        cipher: Arc<dyn PayloadCipher>,
        cfg: MeshConfig,
    ) -> Arc<Self> {
        let clock = ClockSync::new(ctx, store.clone(), &base);
        let peer_id = room.peer_id();
        Arc::new(Self {
            store,
            room,
            clock,
            base,
            peer_id,
            key,
            cipher,
            cfg,
            sent: Mutex::new(HashMap::new()),
        })
    }

    /// Drive the whole mesh lifecycle until aborted.
    pub async fn run(
        self: Arc<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<OutboundSignal>,
    ) -> Result<(), StoreError> {
        let mut own_create_time = self.publish_announce().await?;
        let mut announces = self.store.watch(&paths::announces(&self.base)).await?;
        let mut inbox = self.store.watch(&paths::signals(&self.base, self.peer_id)).await?;

        let mut refresh = tokio::time::interval(self.cfg.announce_refresh);
        refresh.tick().await; // immediate first tick is the publish above
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut known: HashMap<Uuid, Millis> = HashMap::new();

        loop {
            tokio::select! {
                batch = announces.recv() => {
                    let Some(batch) = batch else {
                        return Err(StoreError::FeedClosed);
                    };
                    for event in batch {
                        self.on_announce_event(&event, &mut own_create_time, &mut known).await;
                    }
                }
                batch = inbox.recv() => {
                    let Some(batch) = batch else {
                        return Err(StoreError::FeedClosed);
                    };
                    for event in batch {
                        if event.kind != FeedKind::Removed {
                            self.on_inbox_record(&event.doc).await;
                        }
                    }
                }
                signal = signal_rx.recv() => {
                    let Some(signal) = signal else {
                        return Ok(());
                    };
                    self.relay_out(signal).await;
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.publish_announce().await {
                        log::warn!("Announce refresh failed: {e}");
                    }
                }
                _ = watchdog.tick() => {
                    self.evict_stalled(&mut known).await;
                    self.connect_known(own_create_time, &known).await;
                }
            }
        }
    }

    /// Write (or re-write) our beacon. Returns its server timestamp; on a
    /// fresh record that is also its creation time, which drives the
    /// tie-break.
    async fn publish_announce(&self) -> Result<Millis, StoreError> {
        let body = AnnounceMsg { from: self.peer_id }
            .encode()
            .and_then(|plain| {
                seal(self.key.as_ref(), self.cipher.as_ref(), &plain)
                    .map_err(|e| crate::protocol::ProtocolError::Encode(e.to_string()))
            })
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let ts = self.store.set(&paths::announce(&self.base, self.peer_id), body).await?;
        log::debug!("Announce published for {} at {ts}", self.peer_id);
        Ok(ts)
    }

    async fn on_announce_event(
        &self,
        event: &crate::store::FeedEvent,
        own_create_time: &mut Millis,
        known: &mut HashMap<Uuid, Millis>,
    ) {
        let Ok(remote) = event.doc.id.parse::<Uuid>() else {
            log::warn!("Skipping announce with malformed id {:?}", event.doc.id);
            return;
        };

        match event.kind {
            FeedKind::Removed => {
                if remote == self.peer_id {
                    // Someone (an evicting peer, a janitor) deleted our
                    // beacon while we are alive. Put it back.
                    log::info!("Own announce removed, republishing");
                    match self.publish_announce().await {
                        // The recreated record carries a new creation time;
                        // the tie-break must follow it.
                        Ok(ts) => *own_create_time = ts,
                        Err(e) => log::warn!("Announce self-heal failed: {e}"),
                    }
                } else {
                    known.remove(&remote);
                }
                return;
            }
            FeedKind::Added | FeedKind::Modified => {}
        }
        if remote == self.peer_id {
            return;
        }
        let (Some(create_time), Some(update_time)) = (event.doc.create_time, event.doc.update_time)
        else {
            return;
        };

        // Expired beacons are garbage left by dead peers.
        let now = self.clock.current_time().await;
        if now - update_time > self.cfg.announce_ttl.as_millis() as Millis {
            log::debug!("Removing expired announce of {remote}");
            let _ = self.store.delete(&paths::announce(&self.base, remote)).await;
            known.remove(&remote);
            return;
        }

        let plain = match open(self.key.as_ref(), self.cipher.as_ref(), &event.doc.data) {
            Ok(plain) => plain,
            Err(CryptoError::KeyMismatch) => {
                log::debug!("Ignoring announce of {remote}: different room key");
                return;
            }
            Err(e) => {
                log::warn!("Ignoring undecodable announce of {remote}: {e}");
                return;
            }
        };
        match AnnounceMsg::decode(&plain) {
            Ok(msg) if msg.from == remote => {}
            Ok(msg) => {
                log::warn!("Ignoring announce of {remote} claiming to be {}", msg.from);
                return;
            }
            Err(e) => {
                log::warn!("Ignoring malformed announce of {remote}: {e}");
                return;
            }
        }
        known.insert(remote, create_time);

        if self.room.has_conn(remote).await {
            return;
        }
        if self.room.conn_count().await >= self.cfg.max_conns {
            log::debug!("At connection ceiling, ignoring {remote} for now");
            return;
        }
        if initiates((*own_create_time, self.peer_id), (create_time, remote)) {
            log::debug!("Initiating link to {remote}");
            if let Err(e) = self.room.open_link(remote, true).await {
                log::warn!("Link attempt to {remote} failed: {e}");
            }
        }
    }

    /// Consume one inbox record: delete it, then hand the payload to the
    /// room's link for the sender.
    async fn on_inbox_record(&self, doc: &crate::store::DocSnapshot) {
        let path = paths::signal(&self.base, self.peer_id, &doc.id);
        if let Err(e) = self.store.delete(&path).await {
            log::warn!("Inbox record {path} delete failed: {e}");
        }

        let plain = match open(self.key.as_ref(), self.cipher.as_ref(), &doc.data) {
            Ok(plain) => plain,
            Err(CryptoError::KeyMismatch) => {
                log::debug!("Dropping inbox record from another room key");
                return;
            }
            Err(e) => {
                log::warn!("Dropping undecodable inbox record: {e}");
                return;
            }
        };
        let msg = match SignalMsg::decode(&plain) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed inbox record: {e}");
                return;
            }
        };
        if msg.to != self.peer_id {
            log::warn!("Dropping misdelivered signal for {}", msg.to);
            return;
        }
        if let Err(e) = self.room.deliver_signal(msg.from, &msg.payload).await {
            log::warn!("Signal delivery from {} failed: {e}", msg.from);
        }
    }

    /// Write one outbound handshake blob into the remote inbox.
    async fn relay_out(&self, signal: OutboundSignal) {
        let msg = SignalMsg { to: signal.to, from: self.peer_id, payload: signal.payload };
        let body = match msg.encode().map_err(|e| e.to_string()).and_then(|plain| {
            seal(self.key.as_ref(), self.cipher.as_ref(), &plain).map_err(|e| e.to_string())
        }) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Signal encode for {} failed: {e}", signal.to);
                return;
            }
        };
        let path = paths::signal(&self.base, signal.to, &Uuid::new_v4().to_string());
        match self.store.set(&path, body).await {
            Ok(_) => {
                self.sent.lock().expect("signaling lock").entry(signal.to).or_default().push(path);
            }
            Err(e) => log::warn!("Signal relay to {} failed: {e}", signal.to),
        }
    }

    /// Drop peers whose handshake ran past the deadline, deleting their
    /// beacon, everything we sent them, and their known-list entry.
    async fn evict_stalled(&self, known: &mut HashMap<Uuid, Millis>) {
        let stalled = self.room.connecting_longer_than(self.cfg.connect_timeout).await;
        for remote in stalled {
            log::info!("Evicting unresponsive peer {remote}");
            known.remove(&remote);
            let mut deletions = vec![paths::announce(&self.base, remote)];
            if let Some(sent) = self.sent.lock().expect("signaling lock").remove(&remote) {
                deletions.extend(sent);
            }
            join_all(deletions.iter().map(|path| self.store.delete(path))).await;
            self.room.drop_conn(remote).await;
        }
    }

    /// Offer links to known peers we are not connected to yet. Announces
    /// arriving at a full link table are deferred here, so an eviction or
    /// disconnect hands its slot to the next peer in line.
    async fn connect_known(&self, own_create_time: Millis, known: &HashMap<Uuid, Millis>) {
        for (&remote, &create_time) in known {
            if self.room.conn_count().await >= self.cfg.max_conns {
                return;
            }
            if self.room.has_conn(remote).await {
                continue;
            }
            if initiates((own_create_time, self.peer_id), (create_time, remote)) {
                log::debug!("Initiating link to known peer {remote}");
                if let Err(e) = self.room.open_link(remote, true).await {
                    log::warn!("Link attempt to {remote} failed: {e}");
                }
            }
        }
    }

    /// Remove our beacon and any unconsumed blobs we wrote. Called during
    /// provider teardown, after the run task has stopped.
    pub async fn withdraw(&self) {
        let mut deletions = vec![paths::announce(&self.base, self.peer_id)];
        let sent: Vec<Vec<String>> =
            self.sent.lock().expect("signaling lock").drain().map(|(_, v)| v).collect();
        deletions.extend(sent.into_iter().flatten());
        join_all(deletions.iter().map(|path| self.store.delete(path))).await;
    }
}
