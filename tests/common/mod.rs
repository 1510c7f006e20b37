#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use syncstore::converter::{Converter, DocumentConverter, JsonConverter};
use syncstore::driver::flatfile::FlatFileDriver;
use syncstore::driver::memory::{MemoryDriver, MemoryServer};
use syncstore::driver::{ID_FIELD, MTIME_FIELD};
use syncstore::{Db, Driver, Element, StoreError};
use tempfile::TempDir;

pub const DATABASE: &str = "conformance";

/// A database under test plus a back door for operator-style inserts.
pub struct Backend {
    pub db: Db,
    seed: Box<dyn Fn(&str, &str, &Element) + Send + Sync>,
    _dir: Option<TempDir>,
}

impl Backend {
    /// Stores a record with no mtime metadata, bypassing the driver.
    pub fn seed_raw(&self, coll: &str, id: &str, payload: &Element) {
        (self.seed)(coll, id, payload)
    }
}

pub fn memory_backend() -> Backend {
    let server = MemoryServer::new("localhost");
    let driver = Arc::new(MemoryDriver::with_server(Arc::clone(&server)));
    let db = driver
        .open_db(&format!("memory://localhost/{}", DATABASE))
        .unwrap();

    Backend {
        db,
        seed: Box::new(move |coll, id, payload| {
            let mut doc = DocumentConverter.to_document(payload).unwrap();
            doc.insert(
                ID_FIELD.to_string(),
                syncstore::converter::Bson::String(id.to_string()),
            );
            server.insert_raw(DATABASE, coll, doc).unwrap();
        }),
        _dir: None,
    }
}

pub fn flatfile_backend() -> Backend {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(DATABASE);
    let db = Arc::new(FlatFileDriver::new())
        .open_db(&format!("flatfile://{}", root.display()))
        .unwrap();

    Backend {
        db,
        seed: Box::new(move |coll, id, payload| {
            let json = JsonConverter.to_native(payload).unwrap();
            let coll_dir = root.join(coll);
            std::fs::create_dir_all(&coll_dir).unwrap();
            std::fs::write(
                coll_dir.join(format!("{}.json", id)),
                serde_json::to_vec(&json).unwrap(),
            )
            .unwrap();
        }),
        _dir: Some(dir),
    }
}

/// Two independent drivers (two "processes") sharing one server.
pub fn shared_memory_dbs() -> (Arc<MemoryServer>, Db, Db) {
    let server = MemoryServer::new("localhost");
    let uri = format!("memory://localhost/{}", DATABASE);
    let a = Arc::new(MemoryDriver::with_server(Arc::clone(&server)))
        .open_db(&uri)
        .unwrap();
    let b = Arc::new(MemoryDriver::with_server(Arc::clone(&server)))
        .open_db(&uri)
        .unwrap();
    (server, a, b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub level: i64,
    pub tags: Vec<String>,
}

pub fn player(name: &str, level: i64) -> Player {
    Player {
        name: name.to_string(),
        level,
        tags: Vec::new(),
    }
}

/// A payload exercising every element shape plus awkward keys.
pub fn rich_payload() -> Element {
    let mut nested = Element::object();
    nested.insert("x.y", 1.5);
    nested.insert("$where", "literal");
    nested.insert("back\\slash", true);

    let mut payload = Element::object();
    payload.insert("name", "Steve");
    payload.insert("level", 42);
    payload.insert("big", i64::MAX);
    payload.insert("ratio", 0.25);
    payload.insert("online", false);
    payload.insert("nothing", Element::Null);
    payload.insert(
        "inventory",
        Element::Array(vec![Element::from("sword"), Element::from(3), Element::object()]),
    );
    payload.insert("nested", nested);
    payload
}

// ---------------------------------------------------------------------------
// Driver conformance checks
// ---------------------------------------------------------------------------

pub fn check_round_trip(backend: &Backend) {
    let payload = rich_payload();
    let mtime = backend.db.save("players", "steve", &payload).unwrap();

    let record = backend.db.load("players", "steve").unwrap().unwrap();
    assert_eq!(record.payload, payload);
    assert_eq!(record.mtime, mtime);
    assert_eq!(backend.db.get_mtime("players", "steve").unwrap(), Some(mtime));
}

pub fn check_monotonic_mtime(backend: &Backend) {
    let mut last = 0;
    for level in 0..50 {
        let mut payload = Element::object();
        payload.insert("level", level);
        let mtime = backend.db.save("players", "steve", &payload).unwrap();
        assert!(mtime > last, "mtime {} not after {}", mtime, last);
        last = mtime;
    }
    assert_eq!(backend.db.get_mtime("players", "steve").unwrap(), Some(last));
}

pub fn check_absent_semantics(backend: &Backend) {
    let db = &backend.db;
    assert!(db.load("players", "ghost").unwrap().is_none());
    assert_eq!(db.get_mtime("players", "ghost").unwrap(), None);
    assert!(!db.contains_id("players", "ghost").unwrap());

    db.save("players", "steve", &Element::object()).unwrap();
    db.delete("players", "steve").unwrap();
    assert!(db.load("players", "steve").unwrap().is_none());
    assert_eq!(db.get_mtime("players", "steve").unwrap(), None);
    assert!(!db.get_id_to_mtime("players").unwrap().contains_key("steve"));
}

pub fn check_zero_default_mtime(backend: &Backend) {
    let mut payload = Element::object();
    payload.insert("name", "Alex");
    backend.seed_raw("players", "alex", &payload);

    let db = &backend.db;
    assert_eq!(db.get_mtime("players", "alex").unwrap(), Some(0));
    assert_eq!(db.get_id_to_mtime("players").unwrap().get("alex"), Some(&0));
    let record = db.load("players", "alex").unwrap().unwrap();
    assert_eq!(record.mtime, 0);
    assert_eq!(record.payload, payload);

    // The next save moves it onto the clock.
    assert!(db.save("players", "alex", &payload).unwrap() > 0);
}

pub fn check_idempotent_delete(backend: &Backend) {
    let db = &backend.db;
    db.save("players", "steve", &Element::object()).unwrap();
    db.delete("players", "steve").unwrap();
    db.delete("players", "steve").unwrap();
    db.delete("players", "never-existed").unwrap();
    assert!(!db.contains_id("players", "steve").unwrap());
}

pub fn check_upsert_replaces(backend: &Backend) {
    let db = &backend.db;
    let mut first = Element::object();
    first.insert("a", 1);
    first.insert("b", 2);
    db.save("players", "steve", &first).unwrap();

    let mut second = Element::object();
    second.insert("a", 10);
    db.save("players", "steve", &second).unwrap();

    let record = db.load("players", "steve").unwrap().unwrap();
    assert_eq!(record.payload, second);
    assert_eq!(db.list_ids("players").unwrap().len(), 1);
}

pub fn check_enumeration(backend: &Backend) {
    let db = &backend.db;
    let a = db.save("players", "a", &Element::object()).unwrap();
    let b = db.save("players", "b", &Element::object()).unwrap();
    db.save("guilds", "g", &Element::object()).unwrap();

    let ids: Vec<String> = db.list_ids("players").unwrap().into_iter().collect();
    assert_eq!(ids, vec!["a", "b"]);

    let mtimes = db.get_id_to_mtime("players").unwrap();
    assert_eq!(mtimes.len(), 2);
    assert_eq!(mtimes["a"], a);
    assert_eq!(mtimes["b"], b);

    let names: Vec<String> = db.list_collection_names().unwrap().into_iter().collect();
    assert_eq!(names, vec!["guilds", "players"]);

    assert!(db.list_ids("empty").unwrap().is_empty());
    assert!(db.get_id_to_mtime("empty").unwrap().is_empty());
}

pub fn check_reserved_fields(backend: &Backend) {
    for field in [ID_FIELD, MTIME_FIELD] {
        let mut payload = Element::object();
        payload.insert(field, 1);
        let err = backend.db.save("players", "steve", &payload).unwrap_err();
        assert!(err.is_serialization(), "{field}: {err}");
    }

    let err = backend
        .db
        .save("players", "steve", &Element::from("scalar"))
        .unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
    assert!(!backend.db.contains_id("players", "steve").unwrap());
}

pub fn check_non_finite_rejected(backend: &Backend) {
    let mut payload = Element::object();
    payload.insert("bad", f64::NAN);
    assert!(backend.db.save("players", "steve", &payload).unwrap_err().is_serialization());
}
