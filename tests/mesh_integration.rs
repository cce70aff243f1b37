//! Peer mesh: discovery, awareness fan-out, bus peers, eviction.

use std::sync::Arc;

use meshdoc::{
    AnnounceMsg, DocOptions, DocProvider, DocStore, LocalBus, MemoryStore, MemoryTransport,
    Plaintext, ProviderConfig, ProviderEvent, SyncContext, YrsEngine,
};
use tokio::time::Duration;
use uuid::Uuid;

const BASE: &str = "rooms/doc";

struct Peer {
    provider: Arc<DocProvider>,
    events: tokio::sync::mpsc::UnboundedReceiver<ProviderEvent>,
}

async fn start_peer(
    store: &MemoryStore,
    transport: &Arc<MemoryTransport>,
    bus: Option<Arc<LocalBus>>,
    options: DocOptions,
) -> Peer {
    let provider = DocProvider::start(ProviderConfig {
        ctx: SyncContext::new(),
        store: Arc::new(store.clone()),
        engine: Arc::new(YrsEngine::new(yrs::Doc::new()).unwrap()),
        transport: transport.clone(),
        cipher: Arc::new(Plaintext),
        bus,
        base: BASE.to_string(),
        options,
    })
    .await
    .unwrap();
    let events = provider.take_event_rx().unwrap();
    Peer { provider, events }
}

async fn settle() {
    for _ in 0..128 {
        tokio::task::yield_now().await;
    }
}

fn drain(peer: &mut Peer) -> Vec<ProviderEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = peer.events.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_three_peers_form_a_full_mesh() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(start_peer(&store, &transport, None, DocOptions::default()).await);
        settle().await;
    }
    settle().await;

    for peer in &mut peers {
        let stats = peer.provider.stats().await;
        assert_eq!(stats.connected_peers, 2);
        assert_eq!(stats.connecting_peers, 0, "tie-break permits one link per pair");
        assert!(stats.synced);
        assert!(drain(peer).contains(&ProviderEvent::Synced(true)));
    }

    // Mesh stays stable: no reconnect churn after more time passes.
    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    for peer in &peers {
        assert_eq!(peer.provider.stats().await.connected_peers, 2);
    }

    for peer in &peers {
        peer.provider.destroy().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_awareness_reaches_every_peer() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let a = start_peer(&store, &transport, None, DocOptions::default()).await;
    let mut b = start_peer(&store, &transport, None, DocOptions::default()).await;
    let mut c = start_peer(&store, &transport, None, DocOptions::default()).await;
    settle().await;

    a.provider.set_awareness(Some(b"editing:intro".to_vec())).await;
    settle().await;

    for peer in [&mut b, &mut c] {
        let entries = peer.provider.awareness_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state.as_deref(), Some(&b"editing:intro"[..]));
        assert!(drain(peer).contains(&ProviderEvent::AwarenessChanged));
    }

    a.provider.set_awareness(None).await;
    settle().await;
    assert!(b.provider.awareness_entries().is_empty());
    assert!(c.provider.awareness_entries().is_empty());

    for peer in [&a, &b, &c] {
        peer.provider.destroy().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dead_beacon_evicted_healthy_links_survive() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());

    // A beacon nobody answers for.
    let ghost = Uuid::new_v4();
    let body = meshdoc::crypto::seal(None, &Plaintext, &AnnounceMsg { from: ghost }.encode().unwrap()).unwrap();
    store.set(&format!("{BASE}/aware/announce/{ghost}"), body).await.unwrap();

    let a = start_peer(&store, &transport, None, DocOptions::default()).await;
    let b = start_peer(&store, &transport, None, DocOptions::default()).await;
    settle().await;

    // Both tried the ghost (they announced later), plus each other.
    tokio::time::advance(Duration::from_secs(7)).await;
    settle().await;

    assert!(store.get(&format!("{BASE}/aware/announce/{ghost}")).await.unwrap().is_none());
    for peer in [&a, &b] {
        let stats = peer.provider.stats().await;
        assert_eq!(stats.connected_peers, 1, "real link must survive the eviction");
        assert_eq!(stats.connecting_peers, 0);
    }

    a.provider.destroy().await;
    b.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_destroy_withdraws_cleanly() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let mut a = start_peer(&store, &transport, None, DocOptions::default()).await;
    let b = start_peer(&store, &transport, None, DocOptions::default()).await;
    settle().await;
    assert_eq!(a.provider.stats().await.connected_peers, 1);
    drain(&mut a);

    b.provider.destroy().await;
    settle().await;

    let stats = a.provider.stats().await;
    assert_eq!(stats.connected_peers, 0);
    assert!(!stats.synced);
    assert!(drain(&mut a).contains(&ProviderEvent::Synced(false)));
    assert_eq!(
        store.list(&format!("{BASE}/aware/announce")).await.unwrap().len(),
        1,
        "only the survivor's beacon remains"
    );

    a.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_process_peers_meet_on_the_bus() {
    let store = MemoryStore::new();
    let bus = LocalBus::new();
    // Separate transports: no peer links can form, the bus is the only
    // channel.
    let t1 = Arc::new(MemoryTransport::new());
    let t2 = Arc::new(MemoryTransport::new());
    let a = start_peer(&store, &t1, Some(bus.clone()), DocOptions::default()).await;
    let b = start_peer(&store, &t2, Some(bus.clone()), DocOptions::default()).await;
    settle().await;

    assert_eq!(a.provider.stats().await.bus_peers, 1);
    assert_eq!(b.provider.stats().await.bus_peers, 1);
    assert!(a.provider.is_synced() && b.provider.is_synced());

    a.provider.set_awareness(Some(b"tab-one".to_vec())).await;
    settle().await;
    assert_eq!(b.provider.awareness_entries().len(), 1);

    b.provider.destroy().await;
    settle().await;
    assert_eq!(a.provider.stats().await.bus_peers, 0);

    a.provider.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_passworded_room_invisible_to_open_room() {
    let store = MemoryStore::new();
    let transport = Arc::new(MemoryTransport::new());
    let open = start_peer(&store, &transport, None, DocOptions::default()).await;
    let locked = start_peer(
        &store,
        &transport,
        None,
        DocOptions { password: Some("hunter2".into()), ..DocOptions::default() },
    )
    .await;
    settle().await;
    tokio::time::advance(Duration::from_secs(8)).await;
    settle().await;

    assert_eq!(open.provider.stats().await.connected_peers, 0);
    assert_eq!(locked.provider.stats().await.connected_peers, 0);
    assert!(!open.provider.is_synced());
    assert!(!locked.provider.is_synced());

    open.provider.destroy().await;
    locked.provider.destroy().await;
}
