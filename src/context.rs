//! Process-scoped shared state.
//!
//! One [`SyncContext`] is created per process (or per test, for isolation)
//! and passed to every provider built in it. It owns the two pieces of
//! cross-room shared state: the memoized server-clock offset and the
//! active-room registry enforcing at most one provider per room name.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::store::Millis;

pub struct SyncContext {
    /// Anchor for the local millisecond clock. Reads the tokio clock so
    /// paused-time tests advance it together with store timestamps.
    origin: tokio::time::Instant,
    origin_wall_ms: Millis,
    /// Server-minus-local clock offset, measured once per context.
    clock_delta: Mutex<Option<i64>>,
    /// Names of rooms with a live provider.
    rooms: Mutex<HashSet<String>>,
}

impl SyncContext {
    pub fn new() -> Arc<Self> {
        let origin_wall_ms = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Millis;
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            origin_wall_ms,
            clock_delta: Mutex::new(None),
            rooms: Mutex::new(HashSet::new()),
        })
    }

    /// Local wall-clock milliseconds.
    pub fn local_now_ms(&self) -> Millis {
        self.origin_wall_ms + self.origin.elapsed().as_millis() as Millis
    }

    pub(crate) fn clock_delta(&self) -> Option<i64> {
        *self.clock_delta.lock().expect("context lock")
    }

    /// Memoize the measured offset. First measurement wins.
    pub(crate) fn memoize_clock_delta(&self, delta: i64) {
        let mut guard = self.clock_delta.lock().expect("context lock");
        if guard.is_none() {
            *guard = Some(delta);
        }
    }

    /// Claim a room name. Returns false when a provider already holds it.
    pub(crate) fn register_room(&self, name: &str) -> bool {
        self.rooms.lock().expect("context lock").insert(name.to_string())
    }

    pub(crate) fn unregister_room(&self, name: &str) {
        self.rooms.lock().expect("context lock").remove(name);
    }

    /// Number of live rooms (diagnostics).
    pub fn room_count(&self) -> usize {
        self.rooms.lock().expect("context lock").len()
    }
}
