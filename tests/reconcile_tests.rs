mod common;

use common::{Player, player, shared_memory_dbs};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use syncstore::converter::{Bson, Document, DocumentConverter, to_element};
use syncstore::driver::ID_FIELD;
use syncstore::driver::flatfile::FlatFileDriver;
use syncstore::driver::memory::{MemoryDriver, MemoryServer};
use syncstore::{Coll, CollOptions, Db, Driver, EntityState, ManagedColl, Reconciler, Registry};
use tempfile::TempDir;

/// One simulated process: its own registry, collection and reconciler.
struct Process {
    players: Arc<Coll<Player>>,
    reconciler: Reconciler,
}

impl Process {
    fn new(db: Db) -> Self {
        let registry = Arc::new(Registry::new());
        let players = registry
            .create_coll::<Player>("players", db, CollOptions::default())
            .unwrap();
        Self {
            players,
            reconciler: Reconciler::new(registry),
        }
    }

    fn pass(&self) -> syncstore::PassReport {
        self.reconciler.run_pass()
    }
}

#[test]
fn test_remote_create_is_loaded() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b);

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();

    let report = b.pass();
    assert_eq!(report.reloaded(), 1);
    assert_eq!(b.players.get("steve").unwrap().level, 1);
    assert_eq!(b.players.cached_mtime("steve"), a.players.cached_mtime("steve"));
    assert_eq!(b.players.state_of("steve"), EntityState::CachedClean);
}

#[test]
fn test_stale_cache_converges_to_remote() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b.clone());

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();
    b.pass();

    a.players.modify("steve", |p| p.level = 7);
    a.players.flush();

    let report = b.pass();
    assert_eq!(report.reloaded(), 1);

    let loaded = db_b.load("players", "steve").unwrap().unwrap();
    let cached = b.players.get_entry("steve").unwrap();
    assert_eq!(cached.value.level, 7);
    assert_eq!(cached.mtime, Some(loaded.mtime));

    // Nothing changed since: the next pass is a no-op.
    let report = b.pass();
    assert_eq!(report.reloaded() + report.evicted(), 0);
}

#[test]
fn test_remote_delete_evicts_clean_entry() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b);

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();
    b.pass();
    assert!(b.players.contains("steve"));

    a.players.remove("steve").unwrap();
    let report = b.pass();
    assert_eq!(report.evicted(), 1);
    assert_eq!(b.players.state_of("steve"), EntityState::Absent);
}

#[test]
fn test_dirty_entry_survives_remote_delete() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b.clone());

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();
    b.pass();

    b.players.modify("steve", |p| p.level = 99);
    a.players.remove("steve").unwrap();

    b.pass();
    assert_eq!(b.players.state_of("steve"), EntityState::CachedDirty);
    assert_eq!(b.players.get("steve").unwrap().level, 99);

    // The local change is written back and survives later passes.
    assert_eq!(b.players.flush().saved, 1);
    b.pass();
    assert_eq!(b.players.state_of("steve"), EntityState::CachedClean);
    assert!(db_b.contains_id("players", "steve").unwrap());

    // Once clean, a confirmed remote delete evicts it.
    a.pass();
    a.players.remove("steve").unwrap();
    b.pass();
    assert_eq!(b.players.state_of("steve"), EntityState::Absent);
}

#[test]
fn test_dirty_entry_wins_over_remote_update() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b);

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();
    b.pass();

    b.players.modify("steve", |p| p.level = 50);
    a.players.modify("steve", |p| p.level = 2);
    a.players.flush();

    let report = b.pass();
    assert_eq!(report.colls[0].protected, 1);
    assert_eq!(b.players.get("steve").unwrap().level, 50);
}

#[test]
fn test_local_delete_is_not_resurrected() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a);
    let b = Process::new(db_b);

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.flush();
    b.pass();

    b.players.remove("steve").unwrap();
    b.pass();
    assert!(!b.players.contains("steve"));
    assert_eq!(b.players.stats().tombstones, 0);

    // A newer remote write brings it back.
    a.players.insert("steve", player("Steve", 3)).unwrap();
    a.players.flush();
    b.pass();
    assert_eq!(b.players.get("steve").unwrap().level, 3);
}

#[test]
fn test_seeded_record_without_mtime_is_loaded() {
    let (server, db_a, _db_b) = shared_memory_dbs();
    let a = Process::new(db_a);

    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), Bson::String("alex".into()));
    doc.insert("name".into(), Bson::String("Alex".into()));
    doc.insert("level".into(), Bson::Int32(4));
    doc.insert("tags".into(), Bson::Array(vec![]));
    server.insert_raw(common::DATABASE, "players", doc).unwrap();

    a.pass();
    let cached = a.players.get_entry("alex").unwrap();
    assert_eq!(cached.value.level, 4);
    assert_eq!(cached.mtime, Some(0));
}

#[test]
fn test_mixed_case_remote_id_folds_into_lowercase_collection() {
    let (server, db_a, _db_b) = shared_memory_dbs();
    let registry = Arc::new(Registry::new());
    let players = registry
        .create_coll::<Player>("players", db_a, CollOptions::default().lowercase_ids(true))
        .unwrap();

    let mut doc = DocumentConverter.to_document(&to_element(&player("Steve", 6)).unwrap()).unwrap();
    doc.insert(ID_FIELD.to_string(), Bson::String("Steve".into()));
    server.insert_raw(common::DATABASE, "players", doc).unwrap();

    let reconciler = Reconciler::new(registry);
    assert_eq!(reconciler.run_pass().reloaded(), 1);
    assert_eq!(players.ids(), vec!["steve"]);
    assert_eq!(players.get("Steve").unwrap().level, 6);
    assert!(players.modify("STEVE", |p| p.level = 7));

    // The folded key matches the backend id on later passes.
    let report = reconciler.run_pass();
    assert_eq!(report.reloaded() + report.evicted(), 0);
    assert_eq!(players.state_of("steve"), EntityState::CachedDirty);
}

#[test]
fn test_corrupt_file_does_not_evict_cached_copy() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("main");
    let db = Arc::new(FlatFileDriver::new())
        .open_db(&format!("flatfile://{}", root.display()))
        .unwrap();
    let a = Process::new(db);

    a.players.insert("steve", player("Steve", 1)).unwrap();
    a.players.insert("alex", player("Alex", 2)).unwrap();
    a.players.flush();
    std::fs::write(root.join("players/steve.json"), b"{trunc").unwrap();

    let report = a.pass();
    assert_eq!(report.evicted(), 0);
    assert_eq!(report.reloaded(), 0);
    assert_eq!(a.players.state_of("steve"), EntityState::CachedClean);
    assert_eq!(a.players.get("steve").unwrap().level, 1);

    // A fresh cache cannot decode it, but still loads the rest.
    let b = Process::new(a.players.db().clone());
    let report = b.pass();
    assert_eq!(report.colls[0].failed, 1);
    assert!(b.players.contains("alex"));
    assert!(!b.players.contains("steve"));
}

#[test]
fn test_undecodable_entity_is_isolated() {
    let (server, db_a, _db_b) = shared_memory_dbs();
    let a = Process::new(db_a.clone());

    db_a.save("players", "good", &to_element(&player("Good", 1)).unwrap())
        .unwrap();
    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), Bson::String("bad".into()));
    doc.insert("level".into(), Bson::String("not a number".into()));
    server.insert_raw(common::DATABASE, "players", doc).unwrap();

    let report = a.pass();
    assert_eq!(report.colls[0].failed, 1);
    assert_eq!(report.colls[0].reloaded, 1);
    assert!(a.players.contains("good"));
    assert!(!a.players.contains("bad"));
}

#[test]
fn test_unreachable_backend_does_not_abort_pass() {
    let up = MemoryServer::new("up");
    let down = MemoryServer::new("down");
    let driver = MemoryDriver::new();
    driver.attach_server(Arc::clone(&up));
    driver.attach_server(Arc::clone(&down));
    let driver = Arc::new(driver);

    let db_up = Arc::clone(&driver).open_db("memory://up/main").unwrap();
    let db_down = driver.open_db("memory://down/main").unwrap();
    db_up.save("players", "steve", &to_element(&player("Steve", 1)).unwrap())
        .unwrap();

    let registry = Arc::new(Registry::new());
    let healthy = registry
        .create_coll::<Player>("players", db_up, CollOptions::default())
        .unwrap();
    registry
        .create_coll::<Player>("guilds", db_down, CollOptions::default())
        .unwrap();
    down.set_reachable(false);

    let reconciler = Reconciler::new(registry);
    let report = reconciler.run_pass();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "guilds");
    assert!(healthy.contains("steve"));

    down.set_reachable(true);
    assert!(reconciler.run_pass().is_clean());
    assert_eq!(reconciler.passes(), 2);
    assert_eq!(reconciler.failures(), 1);
}

#[test]
fn test_init_loads_everything() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    for i in 0..10 {
        db_a.save("players", &format!("p{i}"), &to_element(&player("x", i)).unwrap())
            .unwrap();
    }

    let registry = Registry::new();
    let players = registry
        .create_coll::<Player>("players", db_b, CollOptions::default())
        .unwrap();
    assert_eq!(players.init().unwrap(), 10);
    assert!(players.stats().last_reconcile_ms.is_some());
}

#[test]
fn test_concurrent_reload_and_mutation_never_tear() {
    let (_server, db_a, db_b) = shared_memory_dbs();
    let a = Process::new(db_a.clone());
    let b = Arc::new(Process::new(db_b));

    a.players.insert("hot", player("remote", 0)).unwrap();
    a.players.flush();
    b.pass();

    // mtime -> level of every remote write.
    let history: Arc<Mutex<HashMap<i64, i64>>> = Arc::new(Mutex::new(HashMap::new()));
    let observed: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let history = Arc::clone(&history);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut level = 1;
            while !stop.load(Ordering::Relaxed) {
                let payload = to_element(&player("remote", level)).unwrap();
                let mtime = db_a.save("players", "hot", &payload).unwrap();
                history.lock().unwrap().insert(mtime, level);
                level += 1;
            }
        })
    };

    let reconciler = {
        let b = Arc::clone(&b);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                b.pass();
            }
        })
    };

    let mutator = {
        let b = Arc::clone(&b);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                b.players.modify("hot", |p| {
                    p.name = "local".into();
                    p.level = -1;
                });
                ManagedColl::on_tick(b.players.as_ref());
                let _ = b.players.load("hot");
            }
        })
    };

    let reader = {
        let b = Arc::clone(&b);
        let stop = Arc::clone(&stop);
        let observed = Arc::clone(&observed);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Some(cached) = b.players.get_entry("hot") {
                    if let (EntityState::CachedClean, Some(mtime)) = (cached.state, cached.mtime) {
                        observed.lock().unwrap().push((mtime, cached.value.level));
                    }
                }
            }
        })
    };

    thread::sleep(Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);
    for handle in [writer, reconciler, mutator, reader] {
        handle.join().unwrap();
    }

    let history = history.lock().unwrap();
    let observed = observed.lock().unwrap();
    let mut checked = 0;
    for (mtime, level) in observed.iter() {
        if let Some(expected) = history.get(mtime) {
            assert_eq!(level, expected, "payload does not match mtime {}", mtime);
            checked += 1;
        }
    }
    assert!(checked > 0 || observed.is_empty());
}
