use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Acknowledgement level requested from a driver for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    /// The write is durable before the call returns.
    #[default]
    Acknowledged,
    /// The write is handed to the backend without waiting for durability.
    Unacknowledged,
}

/// Store configuration
///
/// Loaded from a JSON file or built in code with the builder methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection descriptor of the default database
    pub db_uri: String,

    /// Named descriptors; `default` always resolves to `db_uri`
    pub aliases: BTreeMap<String, String>,

    /// Pause between reconciliation passes
    pub reconcile_interval_ms: u64,

    /// Foreground tick period
    pub tick_interval_ms: u64,

    /// Upper bound on entity saves performed by one collection tick
    pub flush_per_tick: usize,

    /// Acknowledgement level for saves
    pub write_concern_save: WriteConcern,

    /// Acknowledgement level for deletes
    pub write_concern_delete: WriteConcern,
}

impl StoreConfig {
    pub const DEFAULT_ALIAS: &'static str = "default";

    /// Create a configuration pointing at the given default database
    pub fn new(db_uri: &str) -> Self {
        Self {
            db_uri: db_uri.to_string(),
            aliases: BTreeMap::new(),
            reconcile_interval_ms: 5_000,
            tick_interval_ms: 50,
            flush_per_tick: 64,
            write_concern_save: WriteConcern::Acknowledged,
            write_concern_delete: WriteConcern::Acknowledged,
        }
    }

    /// Register a named descriptor
    pub fn alias(mut self, name: &str, uri: &str) -> Self {
        self.aliases.insert(name.to_string(), uri.to_string());
        self
    }

    /// Set the pause between reconciliation passes
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the foreground tick period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-tick save budget
    pub fn flush_per_tick(mut self, max: usize) -> Self {
        self.flush_per_tick = max;
        self
    }

    /// Set the acknowledgement level for saves
    pub fn write_concern_save(mut self, concern: WriteConcern) -> Self {
        self.write_concern_save = concern;
        self
    }

    /// Set the acknowledgement level for deletes
    pub fn write_concern_delete(mut self, concern: WriteConcern) -> Self {
        self.write_concern_delete = concern;
        self
    }

    pub fn reconcile_interval_duration(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Resolve an alias to a descriptor; anything that is not an alias is
    /// returned unchanged.
    pub fn resolve<'a>(&'a self, name_or_uri: &'a str) -> &'a str {
        if name_or_uri == Self::DEFAULT_ALIAS {
            return &self.db_uri;
        }
        self.aliases
            .get(name_or_uri)
            .map(String::as_str)
            .unwrap_or(name_or_uri)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| StoreError::Config(format!("Failed to read config '{}': {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Config(format!("Failed to parse config '{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.db_uri.is_empty() {
            return Err(StoreError::Config("db_uri cannot be empty".to_string()));
        }

        if self.aliases.contains_key(Self::DEFAULT_ALIAS) {
            return Err(StoreError::Config(
                "alias 'default' is reserved for db_uri".to_string(),
            ));
        }

        if self.reconcile_interval_ms == 0 {
            return Err(StoreError::Config("reconcile_interval_ms must be > 0".to_string()));
        }

        if self.tick_interval_ms == 0 {
            return Err(StoreError::Config("tick_interval_ms must be > 0".to_string()));
        }

        if self.flush_per_tick == 0 {
            return Err(StoreError::Config("flush_per_tick must be > 0".to_string()));
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("memory://localhost/default")
    }
}
