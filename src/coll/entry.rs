use im::HashMap as ImHashMap;
use serde::Serialize;
use std::sync::Arc;

/// Cache state of one id within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Absent,
    CachedClean,
    CachedDirty,
    Saving,
}

impl EntityState {
    /// Local changes that have not reached the backend yet.
    pub fn has_local_changes(self) -> bool {
        matches!(self, Self::CachedDirty | Self::Saving)
    }
}

/// Per-collection behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollOptions {
    /// Normalise every id to lowercase on the way in.
    pub lowercase_ids: bool,
    /// Upper bound on saves performed by one `on_tick`.
    pub flush_per_tick: usize,
}

impl CollOptions {
    pub fn lowercase_ids(mut self, enabled: bool) -> Self {
        self.lowercase_ids = enabled;
        self
    }

    pub fn flush_per_tick(mut self, max: usize) -> Self {
        self.flush_per_tick = max.max(1);
        self
    }
}

impl Default for CollOptions {
    fn default() -> Self {
        Self {
            lowercase_ids: false,
            flush_per_tick: 64,
        }
    }
}

/// What reconciliation and save completion compare against: any change to
/// an entry between observation and apply shows up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryView {
    pub mtime: Option<i64>,
    pub state: EntityState,
    pub rev: u64,
}

/// Point-in-time observation of one id: its entry (if cached) and its
/// tombstone (if deleted locally and not yet confirmed gone remotely).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub entry: Option<EntryView>,
    pub tombstone: Option<i64>,
}

/// Consistent copy of one cache entry.
#[derive(Debug, Clone)]
pub struct Cached<E> {
    pub value: Arc<E>,
    /// Version of the backend copy this entry was loaded from or last saved as.
    pub mtime: Option<i64>,
    pub state: EntityState,
}

#[derive(Debug)]
pub(crate) struct Entry<E> {
    pub value: Arc<E>,
    pub mtime: Option<i64>,
    pub state: EntityState,
    pub rev: u64,
}

// Manual impl: `E` itself need not be `Clone` to clone the `Arc`.
impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            mtime: self.mtime,
            state: self.state,
            rev: self.rev,
        }
    }
}

impl<E> Entry<E> {
    pub fn view(&self) -> EntryView {
        EntryView {
            mtime: self.mtime,
            state: self.state,
            rev: self.rev,
        }
    }
}

/// Everything guarded by a collection's lock.
///
/// Payload and mtime live in the same entry and are only ever replaced
/// together, so readers never pair one version's payload with another's mtime.
#[derive(Debug)]
pub(crate) struct CollState<E> {
    pub entries: ImHashMap<String, Entry<E>>,
    pub tombstones: ImHashMap<String, i64>,
    pub next_rev: u64,
    pub last_reconcile_ms: Option<i64>,
}

impl<E> CollState<E> {
    pub fn new() -> Self {
        Self {
            entries: ImHashMap::new(),
            tombstones: ImHashMap::new(),
            next_rev: 1,
            last_reconcile_ms: None,
        }
    }

    pub fn bump_rev(&mut self) -> u64 {
        let rev = self.next_rev;
        self.next_rev += 1;
        rev
    }

    pub fn slot(&self, id: &str) -> Slot {
        Slot {
            entry: self.entries.get(id).map(Entry::view),
            tombstone: self.tombstones.get(id).copied(),
        }
    }
}

/// Counters describing a collection's cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollStats {
    pub name: String,
    pub cached: usize,
    pub dirty: usize,
    pub saving: usize,
    pub tombstones: usize,
    pub last_reconcile_ms: Option<i64>,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.saved += other.saved;
        self.failed += other.failed;
    }
}
