//! Storage drivers
//!
//! A `Driver` implements the uniform persistence contract once per backend:
//! open a database, enumerate namespaces and ids, read mtimes, and load, save
//! or delete whole entities. Every entity operation is keyed by the database
//! handle, a collection name and a string id, so backends with very different
//! native capabilities can implement the same surface.
//!
//! - `memory.rs` - shared in-process document database (reference backend)
//! - `flatfile.rs` - one JSON file per entity, one directory per collection
//! - `auth.rs` - credential verification used by the document backend
//! - `registry.rs` - scheme dispatch and database handle cache
//! - `copy.rs` - bulk copy between two databases

pub mod auth;
pub mod copy;
pub mod flatfile;
pub mod memory;
mod registry;

pub use copy::{CollCopyStats, CopyReport, copy_db};
pub use registry::DriverRegistry;

use crate::connection::WriteConcern;
use crate::core::element::ElementMap;
use crate::core::{Element, Result, StoreError};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Persisted field holding the entity id.
pub const ID_FIELD: &str = "_id";
/// Persisted field holding the modification time in epoch milliseconds.
pub const MTIME_FIELD: &str = "_mtime";

/// A loaded entity: payload without metadata fields, plus its mtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub payload: Element,
    pub mtime: i64,
}

/// Uniform persistence contract implemented once per backend.
///
/// Absent records are `Ok(None)`, never errors. Records that exist but carry
/// no mtime metadata (seeded by hand) report an mtime of 0.
pub trait Driver: Send + Sync + 'static {
    /// Backend kind; also the descriptor scheme this driver accepts.
    fn name(&self) -> &str;

    /// Parses a connection descriptor and opens a session.
    ///
    /// Rejected credentials fail with `StoreError::Auth`; anything else that
    /// prevents the session, including an unparsable descriptor, fails with
    /// `StoreError::Connection`.
    fn open_db(self: Arc<Self>, uri: &str) -> Result<Db>;

    /// Backend namespaces, excluding internal/system ones.
    fn list_collection_names(&self, db: &Db) -> Result<BTreeSet<String>>;

    fn contains_id(&self, db: &Db, coll: &str, id: &str) -> Result<bool>;

    fn get_mtime(&self, db: &Db, coll: &str, id: &str) -> Result<Option<i64>>;

    fn list_ids(&self, db: &Db, coll: &str) -> Result<BTreeSet<String>>;

    /// Snapshot of every id with its mtime.
    fn get_id_to_mtime(&self, db: &Db, coll: &str) -> Result<HashMap<String, i64>>;

    fn load(&self, db: &Db, coll: &str, id: &str) -> Result<Option<Record>>;

    /// Upserts the payload under a freshly assigned mtime and returns it.
    fn save(&self, db: &Db, coll: &str, id: &str, payload: &Element) -> Result<i64>;

    /// Removes the record; removing a missing id succeeds.
    fn delete(&self, db: &Db, coll: &str, id: &str) -> Result<()>;
}

/// Opaque open-session handle
///
/// Created by a driver's `open_db` and passed back into that driver's calls.
/// Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct Db {
    driver: Arc<dyn Driver>,
    name: Arc<str>,
    descriptor: Arc<str>,
    session: Arc<dyn Any + Send + Sync>,
    write_concern_save: WriteConcern,
    write_concern_delete: WriteConcern,
}

impl Db {
    /// Wraps a driver session. Called by driver implementations.
    pub fn new<S: Any + Send + Sync>(
        driver: Arc<dyn Driver>,
        name: &str,
        descriptor: &str,
        session: S,
    ) -> Self {
        Self {
            driver,
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
            session: Arc::new(session),
            write_concern_save: WriteConcern::default(),
            write_concern_delete: WriteConcern::default(),
        }
    }

    /// Same session with different write acknowledgement levels.
    pub fn with_write_concerns(mut self, save: WriteConcern, delete: WriteConcern) -> Self {
        self.write_concern_save = save;
        self.write_concern_delete = delete;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Database (namespace) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Redacted descriptor the session was opened with.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn write_concern_save(&self) -> WriteConcern {
        self.write_concern_save
    }

    pub fn write_concern_delete(&self) -> WriteConcern {
        self.write_concern_delete
    }

    /// Downcasts the session. Only the driver that created it should call this.
    pub fn session<S: Any + Send + Sync>(&self) -> Result<&S> {
        self.session.downcast_ref::<S>().ok_or_else(|| {
            StoreError::Connection(format!(
                "database handle '{}' was not opened by a compatible driver",
                self.descriptor
            ))
        })
    }

    pub fn list_collection_names(&self) -> Result<BTreeSet<String>> {
        self.driver.list_collection_names(self)
    }

    pub fn contains_id(&self, coll: &str, id: &str) -> Result<bool> {
        self.driver.contains_id(self, coll, id)
    }

    pub fn get_mtime(&self, coll: &str, id: &str) -> Result<Option<i64>> {
        self.driver.get_mtime(self, coll, id)
    }

    pub fn list_ids(&self, coll: &str) -> Result<BTreeSet<String>> {
        self.driver.list_ids(self, coll)
    }

    pub fn get_id_to_mtime(&self, coll: &str) -> Result<HashMap<String, i64>> {
        self.driver.get_id_to_mtime(self, coll)
    }

    pub fn load(&self, coll: &str, id: &str) -> Result<Option<Record>> {
        self.driver.load(self, coll, id)
    }

    pub fn save(&self, coll: &str, id: &str, payload: &Element) -> Result<i64> {
        self.driver.save(self, coll, id, payload)
    }

    pub fn delete(&self, coll: &str, id: &str) -> Result<()> {
        self.driver.delete(self, coll, id)
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("driver", &self.driver.name())
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Checks that a payload can be persisted as a document: it must be an object
/// and must not use the reserved metadata field names.
pub fn check_payload(payload: &Element) -> Result<&ElementMap> {
    let map = payload.as_object().ok_or_else(|| {
        StoreError::Serialization(format!(
            "Entity payload must be an object, got {}",
            payload.type_name()
        ))
    })?;

    for reserved in [ID_FIELD, MTIME_FIELD] {
        if map.contains_key(reserved) {
            return Err(StoreError::Serialization(format!(
                "Field '{}' is reserved for entity metadata",
                reserved
            )));
        }
    }

    Ok(map)
}

pub fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}
