//! End-to-end document sync through a shared store.
//!
//! Each provider gets its own context (one per simulated process) while
//! the store, and with it the update history, is shared.

use std::sync::Arc;

use meshdoc::{
    DocOptions, DocProvider, DocStore, MemoryStore, MemoryTransport, Plaintext, ProviderConfig,
    ProviderEvent, SyncContext, YrsEngine,
};
use tokio::time::Duration;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

const BASE: &str = "rooms/doc";

struct Replica {
    provider: Arc<DocProvider>,
    engine: Arc<YrsEngine>,
    ctx: Arc<SyncContext>,
}

async fn start_replica(
    store: &MemoryStore,
    transport: &Arc<MemoryTransport>,
    options: DocOptions,
) -> Replica {
    let ctx = SyncContext::new();
    let engine = Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap());
    let provider = DocProvider::start(ProviderConfig {
        ctx: ctx.clone(),
        store: Arc::new(store.clone()),
        engine: engine.clone(),
        transport: transport.clone(),
        cipher: Arc::new(Plaintext),
        bus: None,
        base: BASE.to_string(),
        options,
    })
    .await
    .unwrap();
    Replica { provider, engine, ctx }
}

fn edit(engine: &YrsEngine, content: &str) {
    let mut txn = engine.doc().transact_mut();
    let text = txn.get_or_insert_text("t");
    let len = text.len(&txn);
    text.insert(&mut txn, len, content);
}

fn read_text(engine: &YrsEngine) -> String {
    let txn = engine.doc().transact();
    txn.get_text("t").map(|t| t.get_string(&txn)).unwrap_or_default()
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advance past the batcher pause so pending edits flush, then settle.
async fn flush_cycle() {
    settle().await;
    tokio::time::advance(Duration::from_millis(700)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_edits_converge_across_replicas() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let a = start_replica(&store, &transport, DocOptions::default()).await;
    let b = start_replica(&store, &transport, DocOptions::default()).await;
    settle().await;

    edit(&a.engine, "hello");
    flush_cycle().await;
    assert_eq!(read_text(&b.engine), "hello");

    edit(&b.engine, " world");
    flush_cycle().await;
    assert_eq!(read_text(&a.engine), "hello world");
    assert_eq!(read_text(&a.engine), read_text(&b.engine));

    a.provider.destroy().await;
    b.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_burst_flushes_by_count_not_timer() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let options = DocOptions { max_updates_per_blob: 5, ..DocOptions::default() };
    let a = start_replica(&store, &transport, options.clone()).await;
    let b = start_replica(&store, &transport, options).await;
    settle().await;

    for i in 0..5 {
        edit(&a.engine, &i.to_string());
    }
    // No timer advance: the count threshold alone must flush.
    settle().await;
    assert_eq!(read_text(&b.engine).len(), 5);

    let records = store.list(&format!("{BASE}/history/updates")).await.unwrap();
    assert_eq!(records.len(), 1, "a burst coalesces into one record");

    a.provider.destroy().await;
    b.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_replays_history() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let a = start_replica(&store, &transport, DocOptions::default()).await;
    settle().await;

    edit(&a.engine, "persisted");
    a.provider.destroy().await; // destroy flushes

    let late = start_replica(&store, &transport, DocOptions::default()).await;
    settle().await;
    assert_eq!(read_text(&late.engine), "persisted");
    late.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_delete_shuts_peers_down() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let a = start_replica(&store, &transport, DocOptions::default()).await;
    let b = start_replica(&store, &transport, DocOptions::default()).await;
    let mut b_events = b.provider.take_event_rx().unwrap();
    settle().await;

    edit(&a.engine, "short lived");
    flush_cycle().await;

    a.provider.delete_history().await.unwrap();
    settle().await;

    let mut deleted = 0;
    while let Ok(ev) = b_events.try_recv() {
        if ev == ProviderEvent::Deleted {
            deleted += 1;
        }
    }
    assert_eq!(deleted, 1, "remote deletion is reported exactly once");
    assert_eq!(b.ctx.room_count(), 0, "peer must tear itself down");

    // History is gone, sentinel included.
    let records = store.list(&format!("{BASE}/history/updates")).await.unwrap();
    assert!(records.is_empty());

    // A fresh open on the same path starts from an empty, working document.
    let late = start_replica(&store, &transport, DocOptions::default()).await;
    settle().await;
    assert_eq!(read_text(&late.engine), "");
    assert_eq!(late.ctx.room_count(), 1, "reopened path must stay online");
    late.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_own_updates_not_reapplied() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let a = start_replica(&store, &transport, DocOptions::default()).await;
    settle().await;

    edit(&a.engine, "once");
    flush_cycle().await;

    // The flushed record came back on the feed; text must not double.
    assert_eq!(read_text(&a.engine), "once");
    a.provider.destroy().await;
}
