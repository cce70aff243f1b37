//! Server-clock offset estimation.
//!
//! Age-based decisions (history compaction staleness) must agree across
//! replicas whose local clocks drift from the store's. The first call to
//! [`ClockSync::current_time`] probes the store once: write a probe
//! document, take the midpoint of the local times bracketing the write,
//! read back the server-assigned timestamp, and memoize
//! `delta = server - midpoint` in the [`SyncContext`] for the rest of the
//! process. Drift is deliberately not re-measured.

use std::sync::Arc;

use crate::context::SyncContext;
use crate::store::{paths, DocStore, Millis, StoreError};

pub struct ClockSync {
    ctx: Arc<SyncContext>,
    store: Arc<dyn DocStore>,
    probe_path: String,
}

impl ClockSync {
    pub fn new(ctx: Arc<SyncContext>, store: Arc<dyn DocStore>, base_path: &str) -> Self {
        Self {
            ctx,
            store,
            probe_path: paths::time_probe(base_path),
        }
    }

    /// Approximate current server time in milliseconds.
    ///
    /// Falls back to plain local time when the probe fails, without
    /// memoizing, so the next call probes again.
    pub async fn current_time(&self) -> Millis {
        if let Some(delta) = self.ctx.clock_delta() {
            return self.ctx.local_now_ms() + delta;
        }
        match self.probe().await {
            Ok(delta) => {
                self.ctx.memoize_clock_delta(delta);
                self.ctx.local_now_ms() + delta
            }
            Err(e) => {
                log::warn!("Clock probe failed, using local time: {e}");
                self.ctx.local_now_ms()
            }
        }
    }

    /// One write+read round trip against the probe document.
    async fn probe(&self) -> Result<i64, StoreError> {
        let before = self.ctx.local_now_ms();
        let write_ts = self.store.set(&self.probe_path, Vec::new()).await?;
        let after = self.ctx.local_now_ms();
        let midpoint = (before + after) / 2;

        // Read back the committed timestamp; the write result is the
        // fallback if the probe vanished in between.
        let server_ts = self
            .store
            .get(&self.probe_path)
            .await?
            .and_then(|doc| doc.update_time)
            .unwrap_or(write_ts);

        // Probe cleanup is best-effort.
        if let Err(e) = self.store.delete(&self.probe_path).await {
            log::debug!("Clock probe cleanup failed: {e}");
        }

        Ok(server_ts - midpoint)
    }
}
