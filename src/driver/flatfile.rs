//! One JSON file per entity
//!
//! Layout under the database root: `<coll>/<id>.json`, each file holding the
//! payload object plus `_id` and `_mtime`. Files are replaced atomically
//! through a temporary file in the same directory, so a reader never sees a
//! half-written entity.

use super::{Db, Driver, ID_FIELD, MTIME_FIELD, Record, check_id, check_payload};
use crate::connection::{ConnectionDescriptor, WriteConcern};
use crate::converter::{Converter, JsonConverter};
use crate::core::{Element, MtimeClock, Result, StoreError};
use log::warn;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const EXTENSION: &str = "json";

struct FlatFileSession {
    root: PathBuf,
}

impl FlatFileSession {
    fn coll_dir(&self, coll: &str) -> Result<PathBuf> {
        check_name(coll)?;
        Ok(self.root.join(coll))
    }

    fn entity_path(&self, coll: &str, id: &str) -> Result<PathBuf> {
        check_name(id)?;
        Ok(self.coll_dir(coll)?.join(format!("{}.{}", id, EXTENSION)))
    }
}

/// Names become path components: no separators, no hidden files.
fn check_name(name: &str) -> Result<()> {
    check_id(name)?;
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidId(name.to_string()));
    }
    Ok(())
}

fn io_err(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), err))
}

/// Driver for `flatfile:///absolute/path` descriptors.
pub struct FlatFileDriver {
    clock: MtimeClock,
    converter: JsonConverter,
    // Serializes read-previous-mtime + replace within this process.
    write_lock: Mutex<()>,
}

impl FlatFileDriver {
    pub const NAME: &'static str = "flatfile";

    pub fn new() -> Self {
        Self {
            clock: MtimeClock::new(),
            converter: JsonConverter,
            write_lock: Mutex::new(()),
        }
    }

    fn read_json(path: &Path) -> Result<Option<JsonValue>> {
        match fs::read(path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Serialization(format!("{}: {}", path.display(), e))
                })?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    fn mtime_of(value: &JsonValue) -> i64 {
        value.get(MTIME_FIELD).and_then(JsonValue::as_i64).unwrap_or(0)
    }

    /// Entity ids present in a collection directory.
    fn scan_ids(dir: &Path) -> Result<BTreeSet<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(io_err(dir, err)),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Temporary files and other hidden entries.
            if stem.starts_with('.') {
                continue;
            }
            ids.insert(stem.to_string());
        }
        Ok(ids)
    }

    fn write_atomic(path: &Path, bytes: &[u8], concern: WriteConcern) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Io(format!("{} has no parent directory", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| io_err(dir, e))?;
        tmp.write_all(bytes).map_err(|e| io_err(path, e))?;
        if concern == WriteConcern::Acknowledged {
            tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
        }
        tmp.persist(path).map_err(|e| io_err(path, e.error))?;
        Ok(())
    }
}

impl Default for FlatFileDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FlatFileDriver {
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

        let root = descriptor.fs_path();
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::Connection(format!("descriptor '{}' names no directory", descriptor))
            })?;

        fs::create_dir_all(&root).map_err(|e| {
            StoreError::Connection(format!("cannot open '{}': {}", root.display(), e))
        })?;
        if !root.is_dir() {
            return Err(StoreError::Connection(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }

        let descriptor_text = descriptor.to_redacted_string();
        Ok(Db::new(self, &name, &descriptor_text, FlatFileSession { root }))
    }

    fn list_collection_names(&self, db: &Db) -> Result<BTreeSet<String>> {
        let session = db.session::<FlatFileSession>()?;
        let entries = fs::read_dir(&session.root).map_err(|e| io_err(&session.root, e))?;

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&session.root, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && !name.starts_with("system.") {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn contains_id(&self, db: &Db, coll: &str, id: &str) -> Result<bool> {
        let session = db.session::<FlatFileSession>()?;
        Ok(session.entity_path(coll, id)?.is_file())
    }

    fn get_mtime(&self, db: &Db, coll: &str, id: &str) -> Result<Option<i64>> {
        let session = db.session::<FlatFileSession>()?;
        let path = session.entity_path(coll, id)?;
        Ok(Self::read_json(&path)?.map(|value| Self::mtime_of(&value)))
    }

    fn list_ids(&self, db: &Db, coll: &str) -> Result<BTreeSet<String>> {
        let session = db.session::<FlatFileSession>()?;
        Self::scan_ids(&session.coll_dir(coll)?)
    }

    fn get_id_to_mtime(&self, db: &Db, coll: &str) -> Result<HashMap<String, i64>> {
        let session = db.session::<FlatFileSession>()?;
        let dir = session.coll_dir(coll)?;

        let mut out = HashMap::new();
        for id in Self::scan_ids(&dir)? {
            let path = dir.join(format!("{}.{}", id, EXTENSION));
            match Self::read_json(&path) {
                Ok(Some(value)) => {
                    out.insert(id, Self::mtime_of(&value));
                }
                // Deleted between the scan and the read.
                Ok(None) => {}
                // Still present: reported with the zero default so it is not
                // mistaken for a delete.
                Err(err) => {
                    warn!("unreadable entity {}/{}: {}", coll, id, err);
                    out.insert(id, 0);
                }
            }
        }
        Ok(out)
    }

    fn load(&self, db: &Db, coll: &str, id: &str) -> Result<Option<Record>> {
        let session = db.session::<FlatFileSession>()?;
        let path = session.entity_path(coll, id)?;
        let Some(mut value) = Self::read_json(&path)? else {
            return Ok(None);
        };

        let mtime = Self::mtime_of(&value);
        if let Some(map) = value.as_object_mut() {
            map.remove(ID_FIELD);
            map.remove(MTIME_FIELD);
        }
        let payload = self.converter.from_native(&value)?;
        check_payload(&payload)?;
        Ok(Some(Record { payload, mtime }))
    }

    fn save(&self, db: &Db, coll: &str, id: &str, payload: &Element) -> Result<i64> {
        let session = db.session::<FlatFileSession>()?;
        let path = session.entity_path(coll, id)?;
        check_payload(payload)?;

        let mut value = self.converter.to_native(payload)?;
        let _guard = self.write_lock.lock()?;

        // A corrupt previous file is simply replaced.
        let previous = Self::read_json(&path).ok().flatten().map(|v| Self::mtime_of(&v)).unwrap_or(0);
        let mtime = self.clock.next().max(previous + 1);

        if let Some(map) = value.as_object_mut() {
            map.insert(ID_FIELD.to_string(), JsonValue::String(id.to_string()));
            map.insert(MTIME_FIELD.to_string(), JsonValue::from(mtime));
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        Self::write_atomic(&path, &bytes, db.write_concern_save())?;

        Ok(mtime)
    }

    fn delete(&self, db: &Db, coll: &str, id: &str) -> Result<()> {
        let session = db.session::<FlatFileSession>()?;
        let path = session.entity_path(coll, id)?;
        let _guard = self.write_lock.lock()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }
}
