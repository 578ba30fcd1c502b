//! Destination configuration, connection, and lifecycle.
//!
//! A [`Destination`] owns one backend adapter plus the table helper that
//! arbitrates its schemas, and hands out streams. Streams keep the
//! destination alive by holding its `Arc` until they reach a terminal
//! state, so a configuration reload can swap a registry entry while
//! in-flight streams finish against the old connection; pooled resources
//! are released when the last handle drops.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bulker_core::batch_file::BatchFileFormat;
use bulker_core::error::{Error, Result};
use bulker_core::options::{BulkMode, StreamOptions};

use crate::adapter::{Backend, SqlAdapter};
use crate::stream::{self, BulkerStream};
use crate::table_helper::TableHelper;

/// Configuration of one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    /// Unique destination id.
    pub id: String,
    /// Backend type id.
    #[serde(rename = "type")]
    pub backend: Backend,
    /// Target schema / database / dataset, when the backend distinguishes
    /// one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Overrides the adapter's native staging-file format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_file_format: Option<BatchFileFormat>,
    /// Backend-specific connection parameters and credentials.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl DestinationConfig {
    /// Deserializes the backend-specific parameter map into a typed config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when required parameters are missing or
    /// malformed.
    pub fn parameters_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.parameters.clone())).map_err(|e| {
            Error::Config {
                message: format!("destination {}: {e}", self.id),
            }
        })
    }
}

/// Connects to the configured backend and prepares it for streams.
///
/// # Errors
///
/// Returns a classified error when the backend is unreachable, credentials
/// are rejected, or the target database cannot be initialized.
pub async fn connect(config: DestinationConfig) -> Result<Arc<Destination>> {
    let adapter: Box<dyn SqlAdapter> = match config.backend {
        Backend::Postgres => Box::new(crate::postgres::PostgresAdapter::connect(&config).await?),
        Backend::Mysql => Box::new(crate::mysql::MySqlAdapter::connect(&config).await?),
        Backend::Redshift => Box::new(crate::redshift::RedshiftAdapter::connect(&config).await?),
        Backend::Snowflake => Box::new(crate::snowflake::SnowflakeAdapter::connect(&config)?),
        Backend::Bigquery => Box::new(crate::bigquery::BigQueryAdapter::connect(&config)?),
        Backend::Clickhouse => Box::new(crate::clickhouse::ClickHouseAdapter::connect(&config)?),
        Backend::Memory => Box::new(crate::memory::MemoryAdapter::new()),
    };
    let destination = Destination::new(config, adapter);
    destination.adapter().ping().await?;
    destination.adapter().init_database().await?;
    Ok(Arc::new(destination))
}

/// One connected destination.
pub struct Destination {
    config: DestinationConfig,
    adapter: Box<dyn SqlAdapter>,
    table_helper: TableHelper,
}

impl Destination {
    /// Wraps an already-constructed adapter. Used by [`connect`] and by
    /// tests embedding the in-memory backend.
    #[must_use]
    pub fn new(config: DestinationConfig, adapter: Box<dyn SqlAdapter>) -> Self {
        Self {
            config,
            adapter,
            table_helper: TableHelper::new(),
        }
    }

    /// Builds a destination around an adapter with a minimal config.
    #[must_use]
    pub fn with_adapter(id: &str, adapter: Box<dyn SqlAdapter>) -> Arc<Self> {
        let backend = adapter.backend();
        Arc::new(Self::new(
            DestinationConfig {
                id: id.to_owned(),
                backend,
                schema: None,
                batch_file_format: None,
                parameters: serde_json::Map::new(),
            },
            adapter,
        ))
    }

    /// Returns the destination id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Returns the destination configuration.
    #[must_use]
    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    /// Returns the backend adapter.
    #[must_use]
    pub fn adapter(&self) -> &dyn SqlAdapter {
        self.adapter.as_ref()
    }

    /// Returns the schema arbiter for this destination.
    #[must_use]
    pub fn table_helper(&self) -> &TableHelper {
        &self.table_helper
    }

    /// Returns the staging-file format: the configured override, or the
    /// adapter's native choice.
    #[must_use]
    pub fn batch_file_format(&self) -> BatchFileFormat {
        self.config
            .batch_file_format
            .unwrap_or_else(|| self.adapter.batch_file_format())
    }

    /// Creates a stream writing to `table_name` under `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] for inconsistent options and
    /// [`Error::AutocommitUnsupported`] when the backend cannot run
    /// auto-commit streams.
    pub fn create_stream(
        self: &Arc<Self>,
        id: &str,
        table_name: &str,
        mode: BulkMode,
        options: StreamOptions,
    ) -> Result<Box<dyn BulkerStream>> {
        stream::create(Arc::clone(self), id, table_name, mode, options)
    }

    /// Releases pooled resources. Streams still holding this destination
    /// keep it usable; call once the destination is retired.
    ///
    /// # Errors
    ///
    /// Returns the backend error when pools fail to shut down cleanly.
    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }
}

/// Process-wide set of live destinations.
///
/// A configuration reload connects a new [`Destination`] and swaps it in;
/// the replaced one stays alive for exactly as long as its in-flight
/// streams hold it.
#[derive(Default)]
pub struct DestinationRegistry {
    inner: RwLock<HashMap<String, Arc<Destination>>>,
}

impl DestinationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the destination registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Destination>> {
        self.inner
            .read()
            .expect("destination registry poisoned")
            .get(id)
            .cloned()
    }

    /// Registers (or replaces) a destination, returning the replaced one.
    pub fn register(&self, destination: Arc<Destination>) -> Option<Arc<Destination>> {
        self.inner
            .write()
            .expect("destination registry poisoned")
            .insert(destination.id().to_owned(), destination)
    }

    /// Removes a destination, returning it for shutdown.
    pub fn remove(&self, id: &str) -> Option<Arc<Destination>> {
        self.inner
            .write()
            .expect("destination registry poisoned")
            .remove(id)
    }

    /// Returns the registered destination ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .expect("destination registry poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;

    #[test]
    fn config_parses_wire_format() {
        let config: DestinationConfig = serde_json::from_value(serde_json::json!({
            "id": "warehouse",
            "type": "postgres",
            "schema": "public",
            "batchFileFormat": "csv",
            "parameters": {"host": "db.internal", "port": 5432},
        }))
        .unwrap();
        assert_eq!(config.backend, Backend::Postgres);
        assert_eq!(config.batch_file_format, Some(BatchFileFormat::Csv));

        #[derive(Deserialize)]
        struct Params {
            host: String,
            port: u16,
        }
        let params: Params = config.parameters_as().unwrap();
        assert_eq!(params.host, "db.internal");
        assert_eq!(params.port, 5432);
    }

    #[test]
    fn registry_swap_returns_replaced_destination() {
        let registry = DestinationRegistry::new();
        let first = Destination::with_adapter("d1", Box::new(MemoryAdapter::new()));
        assert!(registry.register(Arc::clone(&first)).is_none());

        let second = Destination::with_adapter("d1", Box::new(MemoryAdapter::new()));
        let replaced = registry.register(second).expect("replaced");
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.ids(), vec!["d1".to_owned()]);
    }
}
