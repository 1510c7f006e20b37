//! Live collection registry
//!
//! An explicit object owned by the application's top-level context (see
//! `Store`) rather than a global. The tick dispatcher and the reconciler
//! both iterate a point-in-time snapshot of it.

use crate::coll::{Coll, CollOptions, CollStats, Entity, FlushReport, ManagedColl};
use crate::core::{Result, StoreError};
use crate::driver::Db;
use log::warn;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

#[derive(Default)]
pub struct Registry {
    colls: RwLock<BTreeMap<String, Arc<dyn ManagedColl>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a collection and registers it under its name.
    pub fn create_coll<E: Entity>(
        &self,
        name: &str,
        db: Db,
        options: CollOptions,
    ) -> Result<Arc<Coll<E>>> {
        let coll = Arc::new(Coll::<E>::new(name, db, options)?);
        self.register(Arc::clone(&coll) as Arc<dyn ManagedColl>)?;
        Ok(coll)
    }

    /// Adds a collection. Names are unique.
    pub fn register(&self, coll: Arc<dyn ManagedColl>) -> Result<()> {
        let mut colls = self.colls.write()?;
        let name = coll.name().to_string();
        if colls.contains_key(&name) {
            return Err(StoreError::Config(format!(
                "collection '{}' is already registered",
                name
            )));
        }
        event!(Level::DEBUG, coll = %name, db = %coll.db().descriptor(), "collection registered");
        colls.insert(name, coll);
        Ok(())
    }

    /// Flushes and removes a collection. Returns the flush outcome, or
    /// `None` when no collection had that name.
    pub fn deregister(&self, name: &str) -> Result<Option<FlushReport>> {
        let removed = self.colls.write()?.remove(name);
        Ok(removed.map(|coll| {
            let report = coll.flush();
            if report.failed > 0 {
                warn!(
                    "collection '{}' deregistered with {} unsaved entities",
                    name, report.failed
                );
            }
            report
        }))
    }

    pub fn get_dyn(&self, name: &str) -> Option<Arc<dyn ManagedColl>> {
        self.colls.read().ok()?.get(name).cloned()
    }

    /// Typed lookup; `None` when absent or registered with another entity type.
    pub fn get<E: Entity>(&self, name: &str) -> Option<Arc<Coll<E>>> {
        self.get_dyn(name)?.as_any().downcast::<Coll<E>>().ok()
    }

    /// Collections registered right now.
    pub fn snapshot(&self) -> Vec<Arc<dyn ManagedColl>> {
        self.colls
            .read()
            .map(|colls| colls.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.colls
            .read()
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.colls.read().map(|colls| colls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `on_tick` for every collection.
    pub fn tick_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        for coll in self.snapshot() {
            total.merge(coll.on_tick());
        }
        total
    }

    /// Saves every dirty entity of every collection.
    pub fn flush_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        for coll in self.snapshot() {
            total.merge(coll.flush());
        }
        total
    }

    pub fn stats(&self) -> Vec<CollStats> {
        self.snapshot().iter().map(|coll| coll.stats()).collect()
    }

    /// Clean shutdown: flushes everything, then drops every collection.
    pub fn shutdown(&self) -> Result<FlushReport> {
        let report = self.flush_all();
        self.colls.write()?.clear();
        event!(
            Level::INFO,
            saved = report.saved,
            failed = report.failed,
            "registry shut down"
        );
        Ok(report)
    }
}
