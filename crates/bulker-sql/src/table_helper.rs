//! Schema arbitration and caching.
//!
//! The table helper owns the pipeline's view of destination schemas. It
//! caches resolved tables per destination, serializes schema evolution with
//! a per-table-name keyed lock so concurrent streams cannot race their DDL,
//! and invalidates a cache entry the moment a DDL statement fails against
//! it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bulker_core::error::Result;
use bulker_core::schema::Table;

use crate::adapter::SqlSession;
use crate::dialect::Dialect;

/// Caches `(table name) → resolved schema` and arbitrates schema evolution
/// for one destination.
#[derive(Default)]
pub struct TableHelper {
    cache: Mutex<HashMap<String, Table>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TableHelper {
    /// Creates an empty helper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the destination accept `target`'s schema and returns the
    /// resolved table: creates it when absent, otherwise applies the
    /// additive diff inside the caller's session.
    ///
    /// Ensures for the same table name are serialized through a keyed lock;
    /// the cache is consulted first and updated on success.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the failed DDL; the cache entry is
    /// invalidated so the next ensure re-reads the live schema.
    pub async fn ensure_table(
        &self,
        session: &mut dyn SqlSession,
        dialect: &Dialect,
        target: &Table,
    ) -> Result<Table> {
        self.ensure(session, dialect, target, true).await
    }

    /// Like [`ensure_table`](Self::ensure_table), but always reads the live
    /// schema and never updates the cache. Used by replace flows where the
    /// destination is about to be swapped out from under the cache.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the failed DDL.
    pub async fn ensure_table_without_caching(
        &self,
        session: &mut dyn SqlSession,
        dialect: &Dialect,
        target: &Table,
    ) -> Result<Table> {
        self.ensure(session, dialect, target, false).await
    }

    async fn ensure(
        &self,
        session: &mut dyn SqlSession,
        dialect: &Dialect,
        target: &Table,
        use_cache: bool,
    ) -> Result<Table> {
        let lock = self.lock_for(&target.name);
        let _guard = lock.lock().await;

        let cached = if use_cache {
            self.cached(&target.name)
        } else {
            None
        };
        let current = match cached {
            Some(mut table) => {
                table.cached = true;
                table
            }
            None => session.get_table_schema(&target.name).await?,
        };

        let resolved = dialect.resolve_types(target);

        if !current.exists() {
            if let Err(e) = session.create_table(&resolved).await {
                self.invalidate(&target.name);
                return Err(e);
            }
            if use_cache {
                self.store(resolved.clone());
            }
            return Ok(resolved);
        }

        let diff = current.diff(&resolved);
        let mut merged = current;
        merged.cached = false;
        if diff.exists() {
            if let Err(e) = session.patch_table_schema(&diff).await {
                self.invalidate(&target.name);
                return Err(e);
            }
            merged.columns.extend(diff.columns.clone());
            if diff.delete_pk_fields || !diff.pk_fields.is_empty() {
                merged.pk_fields = diff.pk_fields.clone();
                merged.pk_name = diff.pk_name.clone();
            }
        }
        if use_cache {
            self.store(merged.clone());
        }
        Ok(merged)
    }

    /// Drops the cached schema for a table.
    pub fn invalidate(&self, table_name: &str) {
        self.cache
            .lock()
            .expect("table cache poisoned")
            .remove(table_name);
    }

    /// Returns the cached schema for a table, if any.
    #[must_use]
    pub fn cached(&self, table_name: &str) -> Option<Table> {
        self.cache
            .lock()
            .expect("table cache poisoned")
            .get(table_name)
            .cloned()
    }

    fn store(&self, table: Table) {
        self.cache
            .lock()
            .expect("table cache poisoned")
            .insert(table.name.clone(), table);
    }

    fn lock_for(&self, table_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("table locks poisoned");
        Arc::clone(
            locks
                .entry(table_name.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Folds one record's inferred schema into the accumulated batch schema.
///
/// Column types are joined through the least-common-type lattice, so a
/// column seen as `Int64` and later as `String` inside one batch commits as
/// `String`. Hinted columns (`override_type`) are pinned and never widened.
pub fn coalesce_types(accumulated: &mut Table, incoming: &Table) {
    for (name, column) in &incoming.columns {
        match accumulated.columns.get_mut(name) {
            None => {
                accumulated.columns.insert(name.clone(), column.clone());
            }
            Some(existing) => {
                if existing.override_type {
                    continue;
                }
                let joined = existing.data_type.join(column.data_type);
                if joined != existing.data_type {
                    existing.data_type = joined;
                    existing.sql_type.clear();
                    existing.ddl_type = None;
                }
            }
        }
    }
    if accumulated.pk_fields.is_empty() {
        accumulated.pk_fields = incoming.pk_fields.clone();
        accumulated.pk_name.clone_from(&incoming.pk_name);
    }
    if accumulated.timestamp_column.is_empty() {
        accumulated
            .timestamp_column
            .clone_from(&incoming.timestamp_column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SqlAdapter;
    use crate::memory::MemoryAdapter;
    use bulker_core::schema::Column;
    use bulker_core::types::DataType;

    fn target(columns: &[(&str, DataType)]) -> Table {
        let mut t = Table::new("events");
        for (name, dt) in columns {
            t.columns.insert((*name).to_owned(), Column::of(*dt));
        }
        t
    }

    #[tokio::test]
    async fn ensure_creates_missing_table() {
        let adapter = MemoryAdapter::new();
        let helper = TableHelper::new();
        let mut session = adapter.open_session().await.unwrap();

        let resolved = helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64)]),
            )
            .await
            .unwrap();
        assert_eq!(resolved.columns["id"].sql_type, "bigint");
        assert!(helper.cached("events").is_some());
    }

    #[tokio::test]
    async fn ensure_patches_new_columns() {
        let adapter = MemoryAdapter::new();
        let helper = TableHelper::new();
        let mut session = adapter.open_session().await.unwrap();

        helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64)]),
            )
            .await
            .unwrap();
        let resolved = helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64), ("v", DataType::String)]),
            )
            .await
            .unwrap();
        assert!(resolved.columns.contains_key("v"));

        let live = session.get_table_schema("events").await.unwrap();
        assert!(live.columns.contains_key("v"));
    }

    #[tokio::test]
    async fn failed_ensure_invalidates_cache() {
        let adapter = MemoryAdapter::new();
        let helper = TableHelper::new();
        let mut session = adapter.open_session().await.unwrap();

        helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64)]),
            )
            .await
            .unwrap();

        // table vanishes behind the cache's back
        session.drop_table("events", false).await.unwrap();
        let result = helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64), ("v", DataType::String)]),
            )
            .await;
        assert!(result.is_err());
        assert!(helper.cached("events").is_none());

        // next ensure re-reads live state and recreates
        let resolved = helper
            .ensure_table(
                session.as_mut(),
                adapter.dialect(),
                &target(&[("id", DataType::Int64), ("v", DataType::String)]),
            )
            .await
            .unwrap();
        assert!(resolved.columns.contains_key("v"));
    }

    #[tokio::test]
    async fn concurrent_ensures_serialize_per_table() {
        let adapter = Arc::new(MemoryAdapter::new());
        let helper = Arc::new(TableHelper::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let adapter = Arc::clone(&adapter);
                let helper = Arc::clone(&helper);
                tokio::spawn(async move {
                    let mut session = adapter.open_session().await.unwrap();
                    let column = format!("c{i}");
                    helper
                        .ensure_table(
                            session.as_mut(),
                            adapter.dialect(),
                            &target(&[("id", DataType::Int64), (&column, DataType::String)]),
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut session = adapter.open_session().await.unwrap();
        let live = session.get_table_schema("events").await.unwrap();
        assert_eq!(live.columns.len(), 9);
    }

    #[test]
    fn coalesce_joins_types_and_pins_overrides() {
        let mut accumulated = target(&[("v", DataType::Int64)]);
        coalesce_types(&mut accumulated, &target(&[("v", DataType::String)]));
        assert_eq!(accumulated.columns["v"].data_type, DataType::String);

        let mut pinned = Table::new("events");
        let mut column = Column::of(DataType::Int64);
        column.override_type = true;
        column.sql_type = "bigint".into();
        pinned.columns.insert("v".into(), column);
        coalesce_types(&mut pinned, &target(&[("v", DataType::String)]));
        assert_eq!(pinned.columns["v"].data_type, DataType::Int64);
        assert_eq!(pinned.columns["v"].sql_type, "bigint");
    }
}
