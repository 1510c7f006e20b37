// ============================================================================
// syncstore Library
// ============================================================================

pub mod coll;
pub mod connection;
pub mod converter;
pub mod core;
pub mod driver;
pub mod prelude;
pub mod reconcile;
pub mod registry;
pub mod runtime;

// Re-export main types for convenience
pub use coll::{Coll, CollOptions, CollStats, EntityState, Entity, FlushReport, ManagedColl};
pub use connection::{ConnectionDescriptor, StoreConfig, WriteConcern};
pub use crate::core::{Element, MtimeClock, Result, StoreError};
pub use driver::{CopyReport, Db, Driver, DriverRegistry, Record, copy_db};
pub use reconcile::{PassReport, Reconciler};
pub use registry::Registry;

use driver::flatfile::FlatFileDriver;
use driver::memory::{MemoryDriver, MemoryServer};
use runtime::{Worker, spawn_reconcile_worker, spawn_tick_worker};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

// ============================================================================
// Application context
// ============================================================================

/// Top-level persistence context
///
/// Owns the drivers, the collection registry, the reconciler and the
/// background workers. Collections are created through it so they are
/// registered for ticks and reconciliation.
///
/// # Examples
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use syncstore::{Store, StoreConfig};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Player {
///     level: i64,
/// }
///
/// # fn main() -> syncstore::Result<()> {
/// let store = Store::open(StoreConfig::default())?;
/// let players = store.coll::<Player>("players")?;
///
/// players.insert("steve", Player { level: 1 })?;
/// players.flush();
/// assert!(players.db().contains_id("players", "steve")?);
/// # Ok(())
/// # }
/// ```
pub struct Store {
    config: StoreConfig,
    drivers: Arc<DriverRegistry>,
    registry: Arc<Registry>,
    reconciler: Arc<Reconciler>,
    workers: Mutex<Vec<Worker>>,
}

impl Store {
    /// Creates a store with no drivers registered.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let drivers = Arc::new(DriverRegistry::from_config(&config));
        let registry = Arc::new(Registry::new());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&registry)));

        Ok(Self {
            config,
            drivers,
            registry,
            reconciler,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Creates a store with the built-in drivers: `flatfile` and `memory`
    /// (with a fresh server at `localhost`).
    pub fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.register_driver(Arc::new(FlatFileDriver::new()))?;
        store.register_driver(Arc::new(MemoryDriver::with_server(MemoryServer::new(
            MemoryDriver::DEFAULT_HOST,
        ))))?;
        Ok(store)
    }

    /// Registers (or replaces) a driver under its name.
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> Result<()> {
        self.drivers.register(driver)?;
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Opens a database by alias (`default` included) or descriptor.
    pub fn db(&self, name_or_uri: &str) -> Result<Db> {
        self.drivers.open_db(name_or_uri)
    }

    /// Collection on the default database with the configured options.
    pub fn coll<E: Entity>(&self, name: &str) -> Result<Arc<Coll<E>>> {
        let options = CollOptions::default().flush_per_tick(self.config.flush_per_tick);
        self.coll_in(name, StoreConfig::DEFAULT_ALIAS, options)
    }

    /// Collection on a specific database.
    pub fn coll_in<E: Entity>(
        &self,
        name: &str,
        db: &str,
        options: CollOptions,
    ) -> Result<Arc<Coll<E>>> {
        let db = self.db(db)?;
        self.registry.create_coll(name, db, options)
    }

    /// Copies every collection of one database into another.
    pub fn copy_db(&self, from: &str, to: &str) -> Result<CopyReport> {
        copy_db(&self.db(from)?, &self.db(to)?)
    }

    /// Starts the tick and reconcile workers. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock()?;
        if !workers.is_empty() {
            return Err(StoreError::Config("workers already running".into()));
        }
        workers.push(spawn_tick_worker(
            Arc::clone(&self.registry),
            self.config.tick_interval_duration(),
        ));
        workers.push(spawn_reconcile_worker(
            Arc::clone(&self.reconciler),
            self.config.reconcile_interval_duration(),
        ));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().map(|w| !w.is_empty()).unwrap_or(false)
    }

    /// Stops the workers, waiting for any run in progress.
    pub async fn stop(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock()?);
        for worker in workers {
            worker.stop().await?;
        }
        Ok(())
    }

    /// Clean shutdown: stops the workers, then flushes and drops every
    /// collection.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        self.stop().await?;
        let registry = Arc::clone(&self.registry);
        let report = tokio::task::spawn_blocking(move || registry.shutdown())
            .await
            .map_err(|err| StoreError::Worker(format!("shutdown join: {}", err)))??;
        event!(Level::INFO, saved = report.saved, failed = report.failed, "store shut down");
        Ok(report)
    }
}
