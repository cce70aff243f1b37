//! Same-process room bus.
//!
//! Providers in one process that share a room name exchange frames over a
//! named broadcast channel instead of peer links — no store relay, no
//! transport handshake. Frames are pre-encoded [`crate::protocol::BusFrame`]
//! bytes; the bus itself never decodes them, and every subscriber receives
//! every frame (senders drop their own by the `from` field).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Messages buffered per subscriber before a lagging one starts dropping.
const CHANNEL_CAPACITY: usize = 64;

struct Channel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
}

/// Name-keyed broadcast channels shared by the providers of one process.
pub struct LocalBus {
    channels: RwLock<HashMap<String, Channel>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { channels: RwLock::new(HashMap::new()) })
    }

    /// Subscribe to the named channel, creating it on first use.
    pub async fn subscribe(&self, name: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        {
            let channels = self.channels.read().await;
            if let Some(ch) = channels.get(name) {
                return ch.sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after taking the write lock.
        if let Some(ch) = channels.get(name) {
            return ch.sender.subscribe();
        }
        let (sender, rx) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(name.to_string(), Channel { sender });
        rx
    }

    /// Publish a frame to every subscriber of the named channel (the
    /// sender's own subscription included). Returns the receiver count.
    pub async fn publish(&self, name: &str, frame: Arc<Vec<u8>>) -> usize {
        let channels = self.channels.read().await;
        match channels.get(name) {
            Some(ch) => ch.sender.send(frame).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the named channel if nobody is subscribed anymore.
    pub async fn remove_if_idle(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(ch) = channels.get(name) {
            if ch.sender.receiver_count() == 0 {
                channels.remove(name);
                return true;
            }
        }
        false
    }

    /// Number of live channels (diagnostics).
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
