mod common;

use common::{Player, player};
use std::sync::Arc;
use std::time::Duration;
use syncstore::driver::memory::{MemoryDriver, MemoryServer};
use syncstore::{EntityState, Store, StoreConfig};
use tokio::time::{sleep, timeout};

fn config() -> StoreConfig {
    StoreConfig::new("memory://localhost/shared")
        .tick_interval(Duration::from_millis(10))
        .reconcile_interval(Duration::from_millis(20))
}

/// A store whose memory driver talks to `server`.
fn store_on(server: &Arc<MemoryServer>) -> Store {
    let store = Store::new(config()).unwrap();
    store
        .register_driver(Arc::new(MemoryDriver::with_server(Arc::clone(server))))
        .unwrap();
    store
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tick_worker_flushes_dirty_entities() {
    let server = MemoryServer::new("localhost");
    let store = store_on(&server);
    let players = store.coll::<Player>("players").unwrap();
    store.start().unwrap();

    players.insert("steve", player("Steve", 1)).unwrap();
    wait_until(|| players.state_of("steve") == EntityState::CachedClean).await;
    assert!(server.raw("shared", "players", "steve").unwrap().is_some());

    store.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_processes_converge() {
    let server = MemoryServer::new("localhost");
    let a = store_on(&server);
    let b = store_on(&server);
    let players_a = a.coll::<Player>("players").unwrap();
    let players_b = b.coll::<Player>("players").unwrap();
    a.start().unwrap();
    b.start().unwrap();

    players_a.insert("steve", player("Steve", 1)).unwrap();
    wait_until(|| players_b.get("steve").is_some_and(|p| p.level == 1)).await;

    players_b.modify("steve", |p| p.level = 2);
    wait_until(|| players_a.get("steve").is_some_and(|p| p.level == 2)).await;

    players_a.remove("steve").unwrap();
    wait_until(|| !players_b.contains("steve")).await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outage_is_survived() {
    let server = MemoryServer::new("localhost");
    let store = store_on(&server);
    let players = store.coll::<Player>("players").unwrap();
    store.start().unwrap();

    server.set_reachable(false);
    players.insert("steve", player("Steve", 1)).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(players.state_of("steve"), EntityState::CachedDirty);
    assert!(store.is_running());

    server.set_reachable(true);
    wait_until(|| players.state_of("steve") == EntityState::CachedClean).await;

    store.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_flushes_and_stops() {
    let server = MemoryServer::new("localhost");
    let store = Store::new(
        StoreConfig::new("memory://localhost/shared")
            .tick_interval(Duration::from_secs(3600))
            .reconcile_interval(Duration::from_secs(3600)),
    )
    .unwrap();
    store
        .register_driver(Arc::new(MemoryDriver::with_server(Arc::clone(&server))))
        .unwrap();
    let players = store.coll::<Player>("players").unwrap();
    store.start().unwrap();
    assert!(store.start().is_err());

    players.insert("steve", player("Steve", 1)).unwrap();
    let report = store.shutdown().await.unwrap();
    assert_eq!(report.saved, 1);
    assert!(!store.is_running());
    assert!(store.registry().is_empty());
    assert!(server.raw("shared", "players", "steve").unwrap().is_some());
}
