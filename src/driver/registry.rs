use super::{Db, Driver};
use crate::connection::{ConnectionDescriptor, StoreConfig, WriteConcern};
use crate::core::{Result, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// Drivers by name plus one cached `Db` per descriptor.
///
/// Opening the same descriptor twice returns the same session, so every
/// collection bound to a database shares one connection. Names configured as
/// aliases (and `default`) resolve to their descriptor first.
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
    dbs: RwLock<HashMap<String, Db>>,
    config: Option<StoreConfig>,
    write_concern_save: WriteConcern,
    write_concern_delete: WriteConcern,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            dbs: RwLock::new(HashMap::new()),
            config: None,
            write_concern_save: WriteConcern::default(),
            write_concern_delete: WriteConcern::default(),
        }
    }

    /// Registry resolving the aliases of `config` and applying its write
    /// concerns to every opened `Db`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            config: Some(config.clone()),
            write_concern_save: config.write_concern_save,
            write_concern_delete: config.write_concern_delete,
            ..Self::new()
        }
    }

    /// Registers a driver under its own name. Returns the driver it replaced.
    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<Option<Arc<dyn Driver>>> {
        let name = driver.name().to_string();
        let mut drivers = self.drivers.write()?;
        Ok(drivers.insert(name, driver))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .ok()
            .and_then(|drivers| drivers.get(name).cloned())
    }

    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Descriptor an alias stands for; anything else is returned unchanged.
    pub fn resolve<'a>(&'a self, name_or_uri: &'a str) -> &'a str {
        match &self.config {
            Some(config) => config.resolve(name_or_uri),
            None => name_or_uri,
        }
    }

    /// Opens (or returns the cached) database for an alias or descriptor,
    /// dispatching on the descriptor's scheme.
    pub fn open_db(&self, name_or_uri: &str) -> Result<Db> {
        let uri = self.resolve(name_or_uri);
        if let Some(db) = self.dbs.read()?.get(uri) {
            return Ok(db.clone());
        }

        let descriptor = ConnectionDescriptor::parse(uri)?;
        let driver = self.get(descriptor.scheme()).ok_or_else(|| {
            StoreError::Connection(format!(
                "no driver registered for scheme '{}'",
                descriptor.scheme()
            ))
        })?;

        let db = driver
            .open_db(uri)?
            .with_write_concerns(self.write_concern_save, self.write_concern_delete);

        let mut dbs = self.dbs.write()?;
        // Another thread may have opened it meanwhile; keep the first.
        let db = dbs.entry(uri.to_string()).or_insert(db).clone();
        event!(Level::INFO, descriptor = %db.descriptor(), driver = db.driver_name(), "database opened");
        Ok(db)
    }

    /// Forgets a cached session; the next `open_db` reconnects.
    pub fn close_db(&self, name_or_uri: &str) -> Result<bool> {
        let uri = self.resolve(name_or_uri);
        Ok(self.dbs.write()?.remove(uri).is_some())
    }

    pub fn open_count(&self) -> usize {
        self.dbs.read().map(|dbs| dbs.len()).unwrap_or(0)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::flatfile::FlatFileDriver;
    use crate::driver::memory::{MemoryDriver, MemoryServer};

    fn registry() -> DriverRegistry {
        let registry = DriverRegistry::new();
        registry
            .register(Arc::new(MemoryDriver::with_server(MemoryServer::new("localhost"))))
            .unwrap();
        registry.register(Arc::new(FlatFileDriver::new())).unwrap();
        registry
    }

    #[test]
    fn test_dispatch_by_scheme() {
        let registry = registry();
        let db = registry.open_db("memory://localhost/main").unwrap();
        assert_eq!(db.driver_name(), "memory");
        assert_eq!(registry.driver_names(), vec!["flatfile", "memory"]);
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = registry();
        let err = registry.open_db("redis://localhost/0").unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn test_db_is_cached() {
        let registry = registry();
        let a = registry.open_db("memory://localhost/main").unwrap();
        let b = registry.open_db("memory://localhost/main").unwrap();
        a.save("c", "x", &crate::core::Element::object()).unwrap();
        assert!(b.contains_id("c", "x").unwrap());
        assert_eq!(registry.open_count(), 1);

        assert!(registry.close_db("memory://localhost/main").unwrap());
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_write_concerns_applied() {
        let config = StoreConfig::default().write_concern_save(WriteConcern::Unacknowledged);
        let registry = DriverRegistry::from_config(&config);
        registry
            .register(Arc::new(MemoryDriver::with_server(MemoryServer::new("localhost"))))
            .unwrap();
        let db = registry.open_db("memory://localhost/main").unwrap();
        assert_eq!(db.write_concern_save(), WriteConcern::Unacknowledged);
        assert_eq!(db.write_concern_delete(), WriteConcern::Acknowledged);
    }

    #[test]
    fn test_aliases_share_the_cached_db() {
        let config = StoreConfig::new("memory://localhost/main").alias("live", "memory://localhost/main");
        let registry = DriverRegistry::from_config(&config);
        registry
            .register(Arc::new(MemoryDriver::with_server(MemoryServer::new("localhost"))))
            .unwrap();

        registry.open_db("default").unwrap();
        registry.open_db("live").unwrap();
        registry.open_db("memory://localhost/main").unwrap();
        assert_eq!(registry.open_count(), 1);
    }
}
