//! Background reconciliation
//!
//! One pass asks the backend of every registered collection for its full
//! id→mtime snapshot, compares it with the cache (`diff`), and applies the
//! resulting reloads, evictions and tombstone clean-ups. A failing collection
//! is logged and skipped; it never aborts the pass.

mod diff;

pub use diff::{LocalView, Plan, diff};

use crate::coll::ManagedColl;
use crate::core::Result;
use crate::registry::Registry;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{Level, event, info_span};

/// What one pass did to one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollReconcileReport {
    pub coll: String,
    /// Ids in the remote snapshot.
    pub remote: usize,
    pub reloaded: usize,
    pub evicted: usize,
    /// Local deletes confirmed by the backend.
    pub forgotten: usize,
    /// Entries skipped because they carry unsaved local changes.
    pub protected: usize,
    /// Planned actions dropped because the entry changed meanwhile.
    pub conflicts: usize,
    /// Reloads that failed to fetch or decode.
    pub failed: usize,
}

impl CollReconcileReport {
    pub fn new(coll: &str) -> Self {
        Self {
            coll: coll.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of one pass over a registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub colls: Vec<CollReconcileReport>,
    /// Collections whose snapshot could not be fetched, with the error.
    pub failures: Vec<(String, String)>,
}

impl PassReport {
    pub fn reloaded(&self) -> usize {
        self.colls.iter().map(|c| c.reloaded).sum()
    }

    pub fn evicted(&self) -> usize {
        self.colls.iter().map(|c| c.evicted).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.colls.iter().all(|c| c.failed == 0)
    }
}

/// Reconciles one collection against its backend.
///
/// The cache is observed before the remote snapshot is fetched, so anything
/// saved locally in between shows up as a changed observation and is left
/// alone.
pub fn reconcile_coll(coll: &dyn ManagedColl) -> Result<CollReconcileReport> {
    let local = coll.local_view();
    let (remote, backend_ids) = keyed_snapshot(coll, coll.db().get_id_to_mtime(coll.name())?);
    let mut plan = diff(&local, &remote);
    plan.backend_ids = backend_ids;

    let mut report = coll.apply_plan(&local, &plan);
    report.remote = remote.len();
    report.protected = plan.protected;
    Ok(report)
}

/// Re-keys a backend snapshot by cache key. When several backend ids fold
/// onto one key the newest wins.
fn keyed_snapshot(
    coll: &dyn ManagedColl,
    snapshot: HashMap<String, i64>,
) -> (HashMap<String, i64>, HashMap<String, String>) {
    let mut remote: HashMap<String, i64> = HashMap::with_capacity(snapshot.len());
    let mut backend_ids = HashMap::new();
    for (id, mtime) in snapshot {
        let key = coll.cache_key(&id);
        if remote.get(&key).is_some_and(|&newest| newest >= mtime) {
            continue;
        }
        remote.insert(key.clone(), mtime);
        if key == id {
            backend_ids.remove(&key);
        } else {
            backend_ids.insert(key, id);
        }
    }
    (remote, backend_ids)
}

/// Runs reconciliation passes over every collection in a registry.
pub struct Reconciler {
    registry: Arc<Registry>,
    passes: AtomicU64,
    failures: AtomicU64,
}

impl Reconciler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            passes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// One pass over a point-in-time snapshot of the registry. Blocks on
    /// driver I/O.
    pub fn run_pass(&self) -> PassReport {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let colls = self.registry.snapshot();
        let span = info_span!("reconcile.pass", pass, colls = colls.len());
        let _enter = span.enter();
        let started = Instant::now();

        let mut report = PassReport::default();
        for coll in colls {
            match reconcile_coll(coll.as_ref()) {
                Ok(coll_report) => {
                    if coll_report.reloaded + coll_report.evicted > 0 {
                        event!(
                            Level::DEBUG,
                            coll = %coll_report.coll,
                            reloaded = coll_report.reloaded,
                            evicted = coll_report.evicted,
                            "collection reconciled"
                        );
                    }
                    report.colls.push(coll_report);
                }
                Err(err) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("reconcile of collection '{}' failed: {}", coll.name(), err);
                    report.failures.push((coll.name().to_string(), err.to_string()));
                }
            }
        }

        event!(
            Level::DEBUG,
            reloaded = report.reloaded(),
            evicted = report.evicted(),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconcile pass finished"
        );
        report
    }

    /// Passes started so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Collections that failed across all passes.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
