//! Local-update batching.
//!
//! The batcher is the write half of the sync loop. It drains the engine's
//! local-change stream and coalesces deltas in memory, flushing one merged
//! blob per burst instead of one store write per keystroke:
//!
//! ```text
//!   engine changes ──▶ merge into pending ──▶ count >= max? ──▶ flush now
//!                            │                                    ▲
//!                            └── else arm pause timer ────────────┘
//! ```
//!
//! Provider-tagged changes (baseline load, remote applies) are skipped so
//! updates never echo back into history. Flushed payloads are lz4-framed
//! and stored under a structured id carrying the writer's client id, so
//! the reconciler can tell its own records apart on the change feed.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::context::SyncContext;
use crate::engine::{Engine, LocalChange, UpdateOrigin};
use crate::protocol::UpdateId;
use crate::store::{paths, DocStore};

/// Control commands for a running batcher task.
pub(crate) enum BatcherCtl {
    /// Flush whatever is pending, then ack. Used by `destroy` to drain
    /// the buffer before teardown.
    Flush(oneshot::Sender<()>),
}

/// Accumulates local engine updates and writes merged blobs to the store.
///
/// Runs as a dedicated task; see [`UpdateBatcher::run`]. A flush happens
/// when `max_per_blob` updates have accumulated, when the pause timer set
/// by the last change expires, or on an explicit [`BatcherCtl::Flush`].
pub struct UpdateBatcher {
    store: Arc<dyn DocStore>,
    engine: Arc<dyn Engine>,
    ctx: Arc<SyncContext>,
    base: String,
    max_per_blob: usize,
    max_pause: Duration,
    seq: u64,
    pending: Option<Vec<u8>>,
    pending_count: usize,
}

impl UpdateBatcher {
    pub fn new(
        store: Arc<dyn DocStore>,
        engine: Arc<dyn Engine>,
        ctx: Arc<SyncContext>,
        base: String,
        max_per_blob: usize,
        max_pause: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            ctx,
            base,
            max_per_blob: max_per_blob.max(1),
            max_pause,
            seq: 0,
            pending: None,
            pending_count: 0,
        }
    }

    /// Actor loop. Exits when the change stream closes, after a final
    /// forced flush.
    pub async fn run(
        mut self,
        mut changes: mpsc::UnboundedReceiver<LocalChange>,
        mut ctl: mpsc::UnboundedReceiver<BatcherCtl>,
    ) {
        let mut deadline: Option<Instant> = None;
        let mut ctl_open = true;
        loop {
            // Biased so queued changes are absorbed before a control flush
            // runs; a flush requested after an edit always covers it.
            tokio::select! {
                biased;
                change = changes.recv() => match change {
                    Some(change) => {
                        if change.origin == UpdateOrigin::Provider {
                            continue;
                        }
                        self.absorb(change.update);
                        if self.pending_count >= self.max_per_blob {
                            deadline = None;
                            self.flush().await;
                        } else {
                            deadline = Some(Instant::now() + self.max_pause);
                        }
                    }
                    None => {
                        self.flush().await;
                        return;
                    }
                },
                cmd = ctl.recv(), if ctl_open => match cmd {
                    Some(BatcherCtl::Flush(ack)) => {
                        deadline = None;
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => ctl_open = false,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    deadline = None;
                    self.flush().await;
                }
            }
        }
    }

    /// Merge one delta into the pending blob.
    fn absorb(&mut self, update: Vec<u8>) {
        let merged = match self.pending.take() {
            Some(pending) => match self.engine.merge_updates(&[pending.clone(), update]) {
                Ok(merged) => merged,
                Err(e) => {
                    // Keep the blob we had; the dropped delta will be
                    // covered by history compaction of the baseline.
                    log::warn!("Dropping unmergeable local update: {e}");
                    pending
                }
            },
            None => update,
        };
        self.pending = Some(merged);
        self.pending_count += 1;
    }

    /// Write the pending blob as one update record.
    ///
    /// Pending state is reset before the write is awaited; on failure the
    /// payload is merged back so nothing is lost and a later flush retries.
    async fn flush(&mut self) {
        let Some(payload) = self.pending.take() else {
            return;
        };
        let count = self.pending_count;
        self.pending_count = 0;

        let id = UpdateId::new(self.engine.client_id(), self.seq, self.ctx.local_now_ms() as u64);
        self.seq += 1;
        let path = paths::update(&self.base, &id.to_string());
        let compressed = lz4_flex::compress_prepend_size(&payload);

        match self.store.set(&path, compressed).await {
            Ok(ts) => {
                log::debug!("Flushed {count} update(s) as {id} at server time {ts}");
            }
            Err(e) => {
                log::warn!("Update flush {id} failed, retaining payload: {e}");
                let restored = match self.pending.take() {
                    Some(newer) => match self.engine.merge_updates(&[payload.clone(), newer.clone()]) {
                        Ok(merged) => merged,
                        Err(merge_err) => {
                            log::warn!("Re-merge after failed flush failed: {merge_err}");
                            newer
                        }
                    },
                    None => payload,
                };
                self.pending = Some(restored);
                self.pending_count += count;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
