//! In-process document database
//!
//! `MemoryServer` plays the part of a shared document database: several
//! `MemoryDriver`s (one per simulated process) can attach to the same server
//! and observe each other's writes. Documents are stored in the BSON-like
//! native shape with `_id` / `_mtime` metadata fields, exactly as a remote
//! document store would hold them.

use super::auth::AuthManager;
use super::{Db, Driver, ID_FIELD, MTIME_FIELD, Record, check_id, check_payload};
use crate::connection::ConnectionDescriptor;
use crate::converter::{Bson, Document, DocumentConverter};
use crate::core::{Element, MtimeClock, Result, StoreError};
use log::warn;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

type Collection = BTreeMap<String, Document>;
type Database = HashMap<String, Collection>;

/// Namespace created alongside the first user collection, like a real
/// document store's index catalog.
const SYSTEM_INDEXES: &str = "system.indexes";

/// A shared document database reachable under a host name.
pub struct MemoryServer {
    host: String,
    auth: Option<AuthManager>,
    reachable: AtomicBool,
    databases: RwLock<HashMap<String, Database>>,
}

impl MemoryServer {
    /// Creates a server that accepts unauthenticated sessions.
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            auth: None,
            reachable: AtomicBool::new(true),
            databases: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a server that requires credentials checked against `auth`.
    pub fn with_auth(host: &str, auth: AuthManager) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            auth: Some(auth),
            reachable: AtomicBool::new(true),
            databases: RwLock::new(HashMap::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn auth(&self) -> Option<&AuthManager> {
        self.auth.as_ref()
    }

    /// Simulates an outage: every call fails with a connection error while
    /// the server is unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::Connection(format!("server '{}' is unreachable", self.host)))
        }
    }

    /// Inserts a document as an operator would, bypassing any driver. The
    /// document must carry a string `_id`; `_mtime` is optional.
    pub fn insert_raw(&self, database: &str, coll: &str, doc: Document) -> Result<()> {
        let id = doc
            .get(ID_FIELD)
            .and_then(Bson::as_str)
            .ok_or_else(|| StoreError::InvalidId("document has no string _id".into()))?
            .to_string();
        let mut databases = self.databases.write()?;
        collection_mut(&mut databases, database, coll).insert(id, doc);
        Ok(())
    }

    /// Removes a document as an operator would, bypassing any driver.
    pub fn remove_raw(&self, database: &str, coll: &str, id: &str) -> Result<bool> {
        let mut databases = self.databases.write()?;
        Ok(databases
            .get_mut(database)
            .and_then(|db| db.get_mut(coll))
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    /// Raw stored document, metadata fields included.
    pub fn raw(&self, database: &str, coll: &str, id: &str) -> Result<Option<Document>> {
        let databases = self.databases.read()?;
        Ok(databases
            .get(database)
            .and_then(|db| db.get(coll))
            .and_then(|c| c.get(id))
            .cloned())
    }

    pub fn drop_collection(&self, database: &str, coll: &str) -> Result<bool> {
        let mut databases = self.databases.write()?;
        Ok(databases
            .get_mut(database)
            .map(|db| db.remove(coll).is_some())
            .unwrap_or(false))
    }
}

fn collection_mut<'a>(databases: &'a mut HashMap<String, Database>, database: &str, coll: &str) -> &'a mut Collection {
    let db = databases.entry(database.to_string()).or_default();
    if !db.contains_key(coll) {
        db.entry(SYSTEM_INDEXES.to_string()).or_default();
    }
    db.entry(coll.to_string()).or_default()
}

fn stored_mtime(doc: &Document, id: &str) -> i64 {
    match doc.get(MTIME_FIELD) {
        // No _mtime: most likely added to the database by hand.
        None => 0,
        Some(value) => value.as_i64().unwrap_or_else(|| {
            warn!("document '{}' has a non-numeric {} field; treating it as 0", id, MTIME_FIELD);
            0
        }),
    }
}

struct MemorySession {
    server: Arc<MemoryServer>,
    database: String,
}

/// Driver for `memory://[user:password@]host/database` descriptors.
pub struct MemoryDriver {
    servers: RwLock<HashMap<String, Arc<MemoryServer>>>,
    clock: MtimeClock,
    converter: DocumentConverter,
}

impl MemoryDriver {
    pub const NAME: &'static str = "memory";
    pub const DEFAULT_HOST: &'static str = "localhost";

    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            clock: MtimeClock::new(),
            converter: DocumentConverter,
        }
    }

    /// Creates a driver that can reach one server.
    pub fn with_server(server: Arc<MemoryServer>) -> Self {
        let driver = Self::new();
        driver.attach_server(server);
        driver
    }

    /// Makes a server reachable under its host name.
    pub fn attach_server(&self, server: Arc<MemoryServer>) {
        if let Ok(mut servers) = self.servers.write() {
            servers.insert(server.host().to_string(), server);
        }
    }

    fn session<'a>(&self, db: &'a Db) -> Result<&'a MemorySession> {
        let session = db.session::<MemorySession>()?;
        session.server.check_reachable()?;
        Ok(session)
    }

    fn read_coll<T>(&self, db: &Db, coll: &str, f: impl FnOnce(Option<&Collection>) -> T) -> Result<T> {
        let session = self.session(db)?;
        let databases = session.server.databases.read()?;
        let collection = databases.get(&session.database).and_then(|d| d.get(coll));
        Ok(f(collection))
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open_db(self: Arc<Self>, uri: &str) -> Result<Db> {
        let descriptor = ConnectionDescriptor::parse(uri)?;
        if descriptor.scheme() != Self::NAME {
            return Err(StoreError::Connection(format!(
                "descriptor '{}' is not a {} descriptor",
                descriptor,
                Self::NAME
            )));
        }

        let host = descriptor.host().unwrap_or(Self::DEFAULT_HOST);
        let server = self
            .servers
            .read()?
            .get(host)
            .cloned()
            .ok_or_else(|| StoreError::Connection(format!("no server reachable at '{}'", host)))?;
        server.check_reachable()?;

        match (server.auth(), descriptor.credentials()) {
            (Some(auth), Some((username, password))) => {
                auth.authenticate(username, password)?;
            }
            (Some(_), None) => {
                return Err(StoreError::Auth(format!(
                    "server '{}' requires credentials",
                    host
                )));
            }
            (None, _) => {}
        }

        let database = descriptor.database().to_string();
        if database.is_empty() {
            return Err(StoreError::Connection(format!(
                "descriptor '{}' names no database",
                descriptor
            )));
        }

        let session = MemorySession {
            server,
            database: database.clone(),
        };
        let descriptor_text = descriptor.to_redacted_string();
        Ok(Db::new(self, &database, &descriptor_text, session))
    }

    fn list_collection_names(&self, db: &Db) -> Result<BTreeSet<String>> {
        let session = self.session(db)?;
        let databases = session.server.databases.read()?;
        Ok(databases
            .get(&session.database)
            .map(|d| {
                d.keys()
                    .filter(|name| !name.starts_with("system."))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn contains_id(&self, db: &Db, coll: &str, id: &str) -> Result<bool> {
        self.read_coll(db, coll, |c| c.is_some_and(|c| c.contains_key(id)))
    }

    fn get_mtime(&self, db: &Db, coll: &str, id: &str) -> Result<Option<i64>> {
        self.read_coll(db, coll, |c| c.and_then(|c| c.get(id)).map(|doc| stored_mtime(doc, id)))
    }

    fn list_ids(&self, db: &Db, coll: &str) -> Result<BTreeSet<String>> {
        self.read_coll(db, coll, |c| c.map(|c| c.keys().cloned().collect()).unwrap_or_default())
    }

    fn get_id_to_mtime(&self, db: &Db, coll: &str) -> Result<HashMap<String, i64>> {
        self.read_coll(db, coll, |c| {
            c.map(|c| {
                c.iter()
                    .map(|(id, doc)| (id.clone(), stored_mtime(doc, id)))
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn load(&self, db: &Db, coll: &str, id: &str) -> Result<Option<Record>> {
        let Some(mut doc) = self.read_coll(db, coll, |c| c.and_then(|c| c.get(id)).cloned())? else {
            return Ok(None);
        };

        let mtime = stored_mtime(&doc, id);
        doc.remove(ID_FIELD);
        doc.remove(MTIME_FIELD);

        let payload = self.converter.from_document(&doc)?;
        Ok(Some(Record { payload, mtime }))
    }

    fn save(&self, db: &Db, coll: &str, id: &str, payload: &Element) -> Result<i64> {
        check_id(id)?;
        check_payload(payload)?;
        let mut doc = self.converter.to_document(payload)?;

        let session = self.session(db)?;
        let mut databases = session.server.databases.write()?;
        let collection = collection_mut(&mut databases, &session.database, coll);

        let previous = collection.get(id).map(|d| stored_mtime(d, id)).unwrap_or(0);
        let mtime = self.clock.next().max(previous + 1);

        doc.insert(ID_FIELD.to_string(), Bson::String(id.to_string()));
        doc.insert(MTIME_FIELD.to_string(), Bson::Int64(mtime));
        collection.insert(id.to_string(), doc);

        Ok(mtime)
    }

    fn delete(&self, db: &Db, coll: &str, id: &str) -> Result<()> {
        let session = self.session(db)?;
        let mut databases = session.server.databases.write()?;
        if let Some(collection) = databases
            .get_mut(&session.database)
            .and_then(|d| d.get_mut(coll))
        {
            collection.remove(id);
        }
        Ok(())
    }
}
