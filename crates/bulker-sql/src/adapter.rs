//! The warehouse adapter contract.
//!
//! Every backend participates in the stream state machine through two
//! traits: [`SqlAdapter`], the long-lived per-destination object, and
//! [`SqlSession`], one unit of execution: either auto-committing statements
//! or an open transaction, depending on how it was opened. Backends without
//! real transactions (BigQuery, ClickHouse) return emulated sessions whose
//! rollback is a best-effort cleanup of the artifacts they created.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::Result;
use bulker_core::schema::Table;
use bulker_core::types::Record;

use crate::dialect::Dialect;

/// Supported destination backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// PostgreSQL.
    Postgres,
    /// MySQL.
    Mysql,
    /// Amazon Redshift.
    Redshift,
    /// Snowflake.
    Snowflake,
    /// Google BigQuery.
    Bigquery,
    /// ClickHouse.
    Clickhouse,
    /// In-memory backend for tests.
    Memory,
}

impl Backend {
    /// Returns the wire type id used in destination configs.
    #[must_use]
    pub const fn type_id(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redshift => "redshift",
            Self::Snowflake => "snowflake",
            Self::Bigquery => "bigquery",
            Self::Clickhouse => "clickhouse",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id())
    }
}

/// One unit of execution against a destination.
///
/// Sessions opened with [`SqlAdapter::open_tx`] buffer their effects until
/// [`commit`](SqlSession::commit); sessions from
/// [`SqlAdapter::open_session`] apply every operation immediately and their
/// `commit`/`rollback` are no-ops.
#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Returns the destination's schema for `table_name`.
    ///
    /// A table with no columns signals a nonexistent table. Implementations
    /// fill `pk_fields` and `pk_name` when a primary key exists.
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table>;

    /// Creates a table, honoring the temporary flag, primary key, and
    /// partition clause.
    async fn create_table(&mut self, table: &Table) -> Result<()>;

    /// Applies an additive schema patch: adds `patch.columns`, and drops /
    /// recreates the primary key when the patch says so.
    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()>;

    /// Inserts rows one statement at a time; with `merge`, uses the
    /// backend-native upsert.
    async fn insert(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()>;

    /// `INSERT … SELECT` from `source` into `target`; with `merge`, an
    /// upsert-from-select. Returns the number of copied rows when the
    /// backend reports it.
    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64>;

    /// Bulk-loads staged rows into `target`, falling back to prepared
    /// inserts when the backend has no native bulk path. Returns the number
    /// of loaded rows.
    async fn load_table(&mut self, target: &Table, source: &LoadSource) -> Result<u64>;

    /// Swaps `replacement` in place of `target_name`: the old table is
    /// renamed to a `deprecated_…` side table, the replacement takes its
    /// name, and the deprecated table is dropped when `drop_old` is set.
    ///
    /// A failure in the drop step must leave the swap complete and surface
    /// with the `Drop` kind so the caller can retry without the drop.
    async fn replace_table(
        &mut self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()>;

    /// Removes all rows, preserving the schema.
    async fn truncate_table(&mut self, table_name: &str) -> Result<()>;

    /// Drops a table.
    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()>;

    /// Deletes the rows of one partition, by the reserved partition-id
    /// column. Returns the number of deleted rows when known.
    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64>;

    /// Widens a column to the backend's string type in place.
    ///
    /// Only called when the dialect advertises column widening.
    async fn widen_column_to_string(&mut self, table_name: &str, column: &str) -> Result<()>;

    /// Counts rows.
    async fn count(&mut self, table_name: &str) -> Result<u64>;

    /// Reads the full table content. Verification surface for tests and
    /// the admin API; not used on the hot path.
    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>>;

    /// Commits the session. No-op for auto-committing sessions.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the session back. Best-effort artifact cleanup for backends
    /// without real transactions.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A configured destination backend.
#[async_trait]
pub trait SqlAdapter: Send + Sync {
    /// Returns which backend this is.
    fn backend(&self) -> Backend;

    /// Returns the SQL dialect.
    fn dialect(&self) -> &Dialect;

    /// Returns the staging-file format this backend loads natively.
    fn batch_file_format(&self) -> BatchFileFormat;

    /// Whether the backend supports auto-commit (`stream` mode) streams.
    fn supports_autocommit(&self) -> bool {
        true
    }

    /// Verifies connectivity and credentials.
    async fn ping(&self) -> Result<()>;

    /// Creates the target schema/database when the backend supports it.
    /// Idempotent.
    async fn init_database(&self) -> Result<()>;

    /// Opens an auto-committing session.
    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>>;

    /// Opens a transactional session.
    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>>;

    /// Releases pooled resources. Called once, when the destination's last
    /// stream finishes.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_type_ids_are_wire_names() {
        assert_eq!(Backend::Postgres.type_id(), "postgres");
        assert_eq!(Backend::Bigquery.type_id(), "bigquery");
        let parsed: Backend = serde_json::from_str("\"clickhouse\"").unwrap();
        assert_eq!(parsed, Backend::Clickhouse);
    }
}
