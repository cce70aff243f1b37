//! History compaction.
//!
//! Update records accumulate one per flush; left alone they make every
//! cold start replay the whole edit history. The compactor periodically
//! folds records older than the blob TTL into the baseline:
//!
//! ```text
//!   baseline + stale records ──merge──▶ new baseline, records deleted
//! ```
//!
//! The fold is one store transaction, so a crash mid-compaction never
//! loses an update or leaves one applied twice. Records younger than the
//! TTL stay put; they may still be in flight to other replicas. Staleness
//! is judged in server time so replicas with drifting local clocks agree.
//!
//! Every replica compacts. Concurrent attempts are safe: the transaction
//! re-reads each record and skips the ones another replica already folded.

use std::sync::Arc;

use rand::Rng;
use tokio::time::Duration;

use crate::clock::ClockSync;
use crate::context::SyncContext;
use crate::engine::Engine;
use crate::reconciler::ObservedIndex;
use crate::store::{paths, DocStore, Millis, StoreError};

pub struct HistoryCompactor {
    store: Arc<dyn DocStore>,
    engine: Arc<dyn Engine>,
    clock: ClockSync,
    base: String,
    index: Arc<ObservedIndex>,
    ttl_ms: Millis,
}

impl HistoryCompactor {
    pub fn new(
        store: Arc<dyn DocStore>,
        engine: Arc<dyn Engine>,
        ctx: Arc<SyncContext>,
        base: String,
        index: Arc<ObservedIndex>,
        ttl: Duration,
    ) -> Self {
        let clock = ClockSync::new(ctx, store.clone(), &base);
        Self { store, engine, clock, base, index, ttl_ms: ttl.as_millis() as Millis }
    }

    /// Periodic driver. Failed passes are logged and retried next tick.
    pub async fn run(self, every: Duration) {
        // Jitter staggers replicas opened together, so a popular document
        // is not compacted by everyone in the same instant.
        let every = every + Duration::from_millis(rand::thread_rng().gen_range(0..2000));
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticks.tick().await; // immediate first tick
        loop {
            ticks.tick().await;
            match self.compact_once().await {
                Ok(0) => {}
                Ok(n) => log::debug!("Compacted {n} update record(s) for {}", self.base),
                Err(e) => log::warn!("Compaction pass for {} failed: {e}", self.base),
            }
        }
    }

    /// Fold every stale record into the baseline. Returns how many records
    /// were folded; zero when nothing is stale or the document is shutting
    /// down.
    pub async fn compact_once(&self) -> Result<usize, StoreError> {
        let cutoff = self.clock.current_time().await - self.ttl_ms;
        let stale = self.index.stale_ids(cutoff);
        if stale.is_empty() {
            return Ok(0);
        }

        let baseline_path = paths::baseline(&self.base);
        let shutdown_path = paths::shutdown(&self.base);
        let engine = self.engine.clone();
        let base = self.base.clone();
        let mut consumed: Vec<String> = Vec::new();
        let mut shutting_down = false;

        let result = self
            .store
            .transact(Box::new(|tx| {
                if tx.get(&shutdown_path).is_some() {
                    shutting_down = true;
                    return Err(StoreError::TxAborted("document shutting down".into()));
                }

                let mut payloads: Vec<Vec<u8>> = Vec::new();
                if let Some(baseline) = tx.get(&baseline_path) {
                    let payload = lz4_flex::decompress_size_prepended(&baseline.data)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    payloads.push(payload);
                }

                for id in &stale {
                    let path = paths::update(&base, id);
                    // Another replica may have folded it already.
                    let Some(record) = tx.get(&path) else {
                        consumed.push(id.clone());
                        continue;
                    };
                    match lz4_flex::decompress_size_prepended(&record.data) {
                        Ok(payload) => {
                            payloads.push(payload);
                            tx.delete(&path);
                            consumed.push(id.clone());
                        }
                        Err(e) => {
                            // Leave it in place; deleting would lose data.
                            log::warn!("Skipping undecodable record {id} during compaction: {e}");
                        }
                    }
                }
                if payloads.is_empty() {
                    return Ok(());
                }

                let merged = engine
                    .merge_updates(&payloads)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                tx.set(&baseline_path, lz4_flex::compress_prepend_size(&merged));
                Ok(())
            }))
            .await;

        match result {
            Ok(()) => {
                for id in &consumed {
                    self.index.forget(id);
                }
                Ok(consumed.len())
            }
            Err(_) if shutting_down => {
                log::debug!("Compaction skipped for {}: shutdown sentinel present", self.base);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}
