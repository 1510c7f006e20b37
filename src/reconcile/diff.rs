use crate::coll::{EntityState, EntryView};
use std::collections::HashMap;

/// Local side of a comparison: cached entries and local delete tombstones.
#[derive(Debug, Clone, Default)]
pub struct LocalView {
    pub entries: HashMap<String, EntryView>,
    pub tombstones: HashMap<String, i64>,
}

/// What a reconciliation pass should do to one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Changed or unknown remotely: fetch and replace the cached copy.
    pub reload: Vec<String>,
    /// Clean locally and gone remotely.
    pub evict: Vec<String>,
    /// Local deletes the backend now confirms.
    pub forget: Vec<String>,
    /// Entries left alone because they carry unsaved local changes.
    pub protected: usize,
    /// Backend id to load for cache keys that differ from it.
    pub backend_ids: HashMap<String, String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.reload.is_empty() && self.evict.is_empty() && self.forget.is_empty()
    }
}

/// Compares a collection's cache against a remote id→mtime snapshot.
///
/// - remote mtime strictly newer than cached, or id not cached: reload
/// - cached and clean but missing remotely: evict
/// - dirty or saving: never touched
/// - locally deleted: reloaded only if the remote copy is strictly newer
///   than the deleted one; the tombstone is dropped once the id is gone
pub fn diff(local: &LocalView, remote: &HashMap<String, i64>) -> Plan {
    let mut plan = Plan::default();

    for (id, &remote_mtime) in remote {
        if let Some(&deleted_mtime) = local.tombstones.get(id) {
            if remote_mtime > deleted_mtime {
                plan.reload.push(id.clone());
            }
            continue;
        }

        match local.entries.get(id) {
            None => plan.reload.push(id.clone()),
            Some(view) if view.state.has_local_changes() => plan.protected += 1,
            Some(view) => {
                if view.mtime.is_none_or(|cached| remote_mtime > cached) {
                    plan.reload.push(id.clone());
                }
            }
        }
    }

    for (id, view) in &local.entries {
        if remote.contains_key(id) {
            continue;
        }
        if view.state == EntityState::CachedClean {
            plan.evict.push(id.clone());
        } else {
            plan.protected += 1;
        }
    }

    for id in local.tombstones.keys() {
        if !remote.contains_key(id) {
            plan.forget.push(id.clone());
        }
    }

    plan.reload.sort();
    plan.evict.sort();
    plan.forget.sort();
    plan
}
