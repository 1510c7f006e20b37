//! Typed entity collections
//!
//! A `Coll<E>` is a named, id-keyed set of entities bound to one database.
//! It serves reads from an in-memory cache and only reaches the driver on
//! save, delete and explicit load. Each id moves through
//! `Absent → CachedClean ⇄ CachedDirty → Saving → CachedClean`.
//!
//! The cache lives behind one `RwLock` per collection. Driver I/O is always
//! performed with the lock released: state is observed before the call and
//! the result is applied afterwards only if the observation still holds.

mod entry;

pub use entry::{Cached, CollOptions, CollStats, EntityState, EntryView, FlushReport, Slot};
use entry::{CollState, Entry};

use crate::converter::{from_element, to_element};
use crate::core::{MtimeClock, Result, StoreError};
use crate::driver::{Db, check_id};
use crate::reconcile::{CollReconcileReport, LocalView, Plan};
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Anything a collection can hold.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Entity for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Type-erased view of a collection used by the registry, the tick
/// dispatcher and the reconciler.
pub trait ManagedColl: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn db(&self) -> &Db;

    /// Cache key a backend id is stored under.
    fn cache_key(&self, id: &str) -> String;

    /// Bounded periodic maintenance: saves at most `flush_per_tick` dirty
    /// entities.
    fn on_tick(&self) -> FlushReport;

    /// Saves every dirty entity.
    fn flush(&self) -> FlushReport;

    /// Cheap snapshot of the cache taken before fetching remote state.
    fn local_view(&self) -> LocalView;

    /// Applies a reconciliation plan computed against `local`.
    fn apply_plan(&self, local: &LocalView, plan: &Plan) -> CollReconcileReport;

    fn stats(&self) -> CollStats;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct Coll<E: Entity> {
    name: String,
    db: Db,
    options: CollOptions,
    state: RwLock<CollState<E>>,
}

impl<E: Entity> Coll<E> {
    /// Creates an empty collection. Use `Registry::create_coll` so the
    /// collection is registered for ticks and reconciliation.
    pub(crate) fn new(name: &str, db: Db, options: CollOptions) -> Result<Self> {
        if name.is_empty() || name.starts_with("system.") {
            return Err(StoreError::Config(format!("invalid collection name '{}'", name)));
        }
        Ok(Self {
            name: name.to_string(),
            db,
            options,
            state: RwLock::new(CollState::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn options(&self) -> &CollOptions {
        &self.options
    }

    // A panic while holding the lock cannot leave an entry half-written
    // (entries are replaced whole), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, CollState<E>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollState<E>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, id: &str) -> String {
        if self.options.lowercase_ids {
            id.to_lowercase()
        } else {
            id.to_string()
        }
    }

    /// Loads every remote entity into the cache and returns how many are
    /// cached afterwards.
    pub fn init(&self) -> Result<usize> {
        let report = crate::reconcile::reconcile_coll(self)?;
        debug!(
            "collection '{}' initialised: {} loaded, {} failed",
            self.name, report.reloaded, report.failed
        );
        Ok(self.len())
    }

    /// Cached entity, without touching the backend.
    pub fn get(&self, id: &str) -> Option<Arc<E>> {
        let id = self.key(id);
        self.read().entries.get(&id).map(|e| Arc::clone(&e.value))
    }

    /// Cached entity together with its mtime and state, read atomically.
    pub fn get_entry(&self, id: &str) -> Option<Cached<E>> {
        let id = self.key(id);
        self.read().entries.get(&id).map(|e| Cached {
            value: Arc::clone(&e.value),
            mtime: e.mtime,
            state: e.state,
        })
    }

    /// Cached entity, falling back to a backend load.
    ///
    /// A failed load is logged and reported as `None`.
    pub fn get_or_load(&self, id: &str) -> Option<Arc<E>> {
        if let Some(value) = self.get(id) {
            return Some(value);
        }
        match self.load(id) {
            Ok(value) => value,
            Err(err) => {
                warn!("load of {}/{} failed: {}", self.name, id, err);
                None
            }
        }
    }

    /// Fetches the entity from the backend and replaces the cached copy.
    ///
    /// Unsaved local changes are kept: a dirty or saving entity is returned
    /// as cached without a round trip.
    pub fn load(&self, id: &str) -> Result<Option<Arc<E>>> {
        let id = self.key(id);
        let observed = self.read().slot(&id);
        if observed.entry.is_some_and(|view| view.state.has_local_changes()) {
            return Ok(self.get(&id));
        }

        let decoded = match self.db.load(&self.name, &id)? {
            Some(record) => Some((from_element::<E>(&record.payload)?, record.mtime)),
            None => None,
        };

        let mut state = self.write();
        if state.slot(&id) != observed {
            // Changed while we were loading; the newer local state wins.
            return Ok(state.entries.get(&id).map(|e| Arc::clone(&e.value)));
        }

        match decoded {
            Some((value, mtime)) => Ok(Some(install(&mut state, &id, value, mtime))),
            None => {
                state.entries.remove(&id);
                state.tombstones.remove(&id);
                Ok(None)
            }
        }
    }

    /// Puts an entity into the cache as dirty; the next flush saves it.
    pub fn insert(&self, id: &str, value: E) -> Result<()> {
        let id = self.key(id);
        check_id(&id)?;

        let mut state = self.write();
        let rev = state.bump_rev();
        let (mtime, saving) = state
            .entries
            .get(&id)
            .map(|e| (e.mtime, e.state == EntityState::Saving))
            .unwrap_or((None, false));
        state.tombstones.remove(&id);
        state.entries.insert(
            id,
            Entry {
                value: Arc::new(value),
                mtime,
                state: if saving { EntityState::Saving } else { EntityState::CachedDirty },
                rev,
            },
        );
        Ok(())
    }

    /// Saves a new entity under a generated id and caches it clean.
    pub fn create(&self, value: E) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload = to_element(&value)?;
        let mtime = self.db.save(&self.name, &id, &payload)?;

        let mut state = self.write();
        install(&mut state, &id, value, mtime);
        Ok(id)
    }

    /// Mutates a cached entity in place and marks it dirty. Returns `false`
    /// when the id is not cached.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut E)) -> bool {
        let id = self.key(id);
        let mut state = self.write();
        if !state.entries.contains_key(&id) {
            return false;
        }
        let rev = state.bump_rev();
        let Some(entry) = state.entries.get_mut(&id) else {
            return false;
        };

        let mut value = E::clone(&entry.value);
        f(&mut value);
        entry.value = Arc::new(value);
        entry.rev = rev;
        // A save in flight notices the new rev and leaves the entry dirty.
        if entry.state != EntityState::Saving {
            entry.state = EntityState::CachedDirty;
        }
        true
    }

    /// Deletes the entity locally and in the backend.
    ///
    /// Deleting an unknown id succeeds. Returns whether the id was cached.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let id = self.key(id);
        check_id(&id)?;

        let previous = {
            let mut state = self.write();
            let previous = state.entries.remove(&id);
            let deleted_mtime = previous
                .as_ref()
                .and_then(|e| e.mtime)
                .or_else(|| state.tombstones.get(&id).copied())
                .unwrap_or(0);
            state.tombstones.insert(id.clone(), deleted_mtime);
            previous
        };

        match self.db.delete(&self.name, &id) {
            Ok(()) => Ok(previous.is_some()),
            Err(err) => {
                let mut state = self.write();
                state.tombstones.remove(&id);
                if let Some(entry) = previous {
                    if !state.entries.contains_key(&id) {
                        state.entries.insert(id, entry);
                    }
                }
                Err(err)
            }
        }
    }

    /// Saves one entity now, dirty or not. Returns `false` when it is not
    /// cached or already being saved.
    pub fn save_now(&self, id: &str) -> Result<bool> {
        let id = self.key(id);
        self.save_entry(&id, false)
    }

    fn save_entry(&self, id: &str, only_dirty: bool) -> Result<bool> {
        let (value, rev) = {
            let mut state = self.write();
            let Some(entry) = state.entries.get_mut(id) else {
                return Ok(false);
            };
            match entry.state {
                EntityState::Saving => return Ok(false),
                EntityState::CachedClean if only_dirty => return Ok(false),
                _ => {}
            }
            entry.state = EntityState::Saving;
            (Arc::clone(&entry.value), entry.rev)
        };

        let result = to_element(&*value).and_then(|payload| self.db.save(&self.name, id, &payload));

        let mut state = self.write();
        let mtime = match result {
            Ok(mtime) => mtime,
            Err(err) => {
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.state = EntityState::CachedDirty;
                }
                return Err(err);
            }
        };

        if let Some(entry) = state.entries.get_mut(id) {
            entry.mtime = Some(mtime);
            entry.state = if entry.rev == rev {
                EntityState::CachedClean
            } else {
                EntityState::CachedDirty
            };
            return Ok(true);
        }

        // Removed while saving: the save may have landed after the delete.
        if let Some(tombstone) = state.tombstones.get_mut(id) {
            *tombstone = (*tombstone).max(mtime);
            drop(state);
            if let Err(err) = self.db.delete(&self.name, id) {
                warn!("re-delete of {}/{} after concurrent save failed: {}", self.name, id, err);
            }
        }
        Ok(true)
    }

    /// Saves every dirty entity.
    pub fn flush(&self) -> FlushReport {
        self.flush_limited(usize::MAX)
    }

    /// Saves at most `max` dirty entities. Failed saves stay dirty.
    pub fn flush_limited(&self, max: usize) -> FlushReport {
        let dirty: Vec<String> = {
            let state = self.read();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.state == EntityState::CachedDirty)
                .map(|(id, _)| id.clone())
                .take(max)
                .collect()
        };

        let mut report = FlushReport::default();
        for id in dirty {
            match self.save_entry(&id, true) {
                Ok(true) => report.saved += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("save of {}/{} failed: {}", self.name, id, err);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn state_of(&self, id: &str) -> EntityState {
        let id = self.key(id);
        self.read()
            .entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(EntityState::Absent)
    }

    pub fn cached_mtime(&self, id: &str) -> Option<i64> {
        let id = self.key(id);
        self.read().entries.get(&id).and_then(|e| e.mtime)
    }

    pub fn contains(&self, id: &str) -> bool {
        let id = self.key(id);
        self.read().entries.contains_key(&id)
    }

    /// Cached ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let entries = self.read().entries.clone();
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CollStats {
        let state = self.read();
        let mut stats = CollStats {
            name: self.name.clone(),
            cached: state.entries.len(),
            dirty: 0,
            saving: 0,
            tombstones: state.tombstones.len(),
            last_reconcile_ms: state.last_reconcile_ms,
        };
        for entry in state.entries.values() {
            match entry.state {
                EntityState::CachedDirty => stats.dirty += 1,
                EntityState::Saving => stats.saving += 1,
                _ => {}
            }
        }
        stats
    }

    fn local_view(&self) -> LocalView {
        let (entries, tombstones) = {
            let state = self.read();
            (state.entries.clone(), state.tombstones.clone())
        };
        LocalView {
            entries: entries.iter().map(|(id, e)| (id.clone(), e.view())).collect(),
            tombstones: tombstones.iter().map(|(id, t)| (id.clone(), *t)).collect(),
        }
    }

    fn apply_plan(&self, local: &LocalView, plan: &Plan) -> CollReconcileReport {
        let mut report = CollReconcileReport::new(&self.name);
        let observed = |id: &str| Slot {
            entry: local.entries.get(id).copied(),
            tombstone: local.tombstones.get(id).copied(),
        };

        for id in &plan.reload {
            let expected = observed(id.as_str());
            let backend_id = plan.backend_ids.get(id).map_or(id.as_str(), String::as_str);
            let decoded = match self.db.load(&self.name, backend_id) {
                Ok(Some(record)) => match from_element::<E>(&record.payload) {
                    Ok(value) => Some((value, record.mtime)),
                    Err(err) => {
                        warn!("skipping {}/{}: {}", self.name, backend_id, err);
                        report.failed += 1;
                        continue;
                    }
                },
                Ok(None) => None,
                Err(err) => {
                    warn!("reload of {}/{} failed: {}", self.name, backend_id, err);
                    report.failed += 1;
                    continue;
                }
            };

            let mut state = self.write();
            if state.slot(id) != expected {
                report.conflicts += 1;
                continue;
            }
            match decoded {
                // Still the version that was deleted here.
                Some((_, mtime)) if expected.tombstone.is_some_and(|t| mtime <= t) => {}
                Some((value, mtime)) => {
                    install(&mut state, id, value, mtime);
                    report.reloaded += 1;
                }
                None => {
                    if state.entries.remove(id).is_some() {
                        report.evicted += 1;
                    }
                    if state.tombstones.remove(id).is_some() {
                        report.forgotten += 1;
                    }
                }
            }
        }

        let mut state = self.write();
        for id in &plan.evict {
            if state.slot(id) == observed(id.as_str()) {
                state.entries.remove(id);
                report.evicted += 1;
            } else {
                report.conflicts += 1;
            }
        }
        for id in &plan.forget {
            if state.slot(id) == observed(id.as_str()) {
                state.tombstones.remove(id);
                report.forgotten += 1;
            }
        }
        state.last_reconcile_ms = Some(MtimeClock::now_millis());

        report
    }
}

/// Caches a value as clean at `mtime`, replacing whatever was there.
fn install<E>(state: &mut CollState<E>, id: &str, value: E, mtime: i64) -> Arc<E> {
    let rev = state.bump_rev();
    let value = Arc::new(value);
    state.tombstones.remove(id);
    state.entries.insert(
        id.to_string(),
        Entry {
            value: Arc::clone(&value),
            mtime: Some(mtime),
            state: EntityState::CachedClean,
            rev,
        },
    );
    value
}

impl<E: Entity> ManagedColl for Coll<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn db(&self) -> &Db {
        &self.db
    }

    fn cache_key(&self, id: &str) -> String {
        self.key(id)
    }

    fn on_tick(&self) -> FlushReport {
        self.flush_limited(self.options.flush_per_tick)
    }

    fn flush(&self) -> FlushReport {
        Coll::flush(self)
    }

    fn local_view(&self) -> LocalView {
        Coll::local_view(self)
    }

    fn apply_plan(&self, local: &LocalView, plan: &Plan) -> CollReconcileReport {
        Coll::apply_plan(self, local, plan)
    }

    fn stats(&self) -> CollStats {
        Coll::stats(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
