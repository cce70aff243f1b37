//! Binary framing for room traffic and stored mesh records.
//!
//! Three families of frames live here, all bincode-encoded:
//!
//! - [`RoomMessage`] — awareness query/update and local-bus peer
//!   announce/withdraw, multiplexed over peer links and the local bus.
//! - [`AnnounceMsg`] / [`SignalMsg`] — the records a peer writes into the
//!   store's `announce` and `signal` collections to discover other peers
//!   and relay transport handshakes.
//! - [`UpdateId`] — the structured id of a stored update record, rendered
//!   as `<clientHex>-<seq>-<wallMsHex>` so the origin client can be read
//!   back without a separate field.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One client's awareness slot: opaque application state plus a
/// last-writer-wins clock. `state: None` withdraws the slot (client gone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    /// Replicated-document engine client id of the owner.
    pub client_id: u64,
    /// Per-client monotonic clock; higher wins.
    pub clock: u32,
    /// Opaque presence payload (cursor, selection, profile — app-defined).
    pub state: Option<Vec<u8>>,
}

/// Messages multiplexed over both delivery channels (peer links and the
/// local broadcast bus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Ask the receiver for its full awareness snapshot. Always answered
    /// immediately with an `AwarenessUpdate`.
    AwarenessQuery { from: u64 },
    /// One or more awareness slots. Applied to local state, never echoed
    /// back to the sender.
    AwarenessUpdate { entries: Vec<AwarenessEntry> },
    /// A same-process peer joined the room over the local bus.
    BusPeerAnnounce { peer_id: Uuid },
    /// A same-process peer left the room.
    BusPeerWithdraw { peer_id: Uuid },
}

impl RoomMessage {
    /// Serialize to the binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Frame published on the local bus. Carries the sender's room peer id so
/// a subscriber can drop its own frames (the bus echoes to everyone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    pub from: Uuid,
    pub msg: RoomMessage,
}

impl BusFrame {
    pub fn new(from: Uuid, msg: RoomMessage) -> Self {
        Self { from, msg }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Liveness beacon a peer stores under `aware/announce/{peerId}`.
///
/// The store assigns the record's timestamp on write; the body only needs
/// the sender. Re-published on a fixed interval to stay under the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceMsg {
    pub from: Uuid,
}

impl AnnounceMsg {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// One relayed transport handshake blob, stored in the recipient's inbox at
/// `aware/signal/{to}/sig_messages/{msgId}` and deleted once consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMsg {
    pub to: Uuid,
    pub from: Uuid,
    /// Opaque transport signal (offer/answer/candidate — transport-defined).
    pub payload: Vec<u8>,
}

impl SignalMsg {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Structured id of a stored update record.
///
/// Canonical string form: `{client:x}-{seq}-{wall_ms:x}`. The first
/// segment carries the origin engine client id so replicas can tell their
/// own echoed updates apart without another store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateId {
    /// Engine client id of the writer.
    pub client: u64,
    /// Writer-local flush sequence number.
    pub seq: u64,
    /// Writer-local wall clock at flush, in milliseconds.
    pub wall_ms: u64,
}

impl UpdateId {
    pub fn new(client: u64, seq: u64, wall_ms: u64) -> Self {
        Self { client, seq, wall_ms }
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{}-{:x}", self.client, self.seq, self.wall_ms)
    }
}

impl FromStr for UpdateId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let malformed = || ProtocolError::MalformedId(s.to_string());
        let client = parts.next().ok_or_else(malformed)?;
        let seq = parts.next().ok_or_else(malformed)?;
        let wall = parts.next().ok_or_else(malformed)?;
        Ok(Self {
            client: u64::from_str_radix(client, 16).map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
            wall_ms: u64::from_str_radix(wall, 16).map_err(|_| malformed())?,
        })
    }
}

/// Protocol errors. Malformed frames are skipped by consumers, never fatal.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    MalformedId(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::MalformedId(id) => write!(f, "Malformed update record id: {id}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
