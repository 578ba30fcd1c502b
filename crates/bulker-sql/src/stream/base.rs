//! Shared machinery of the transactional stream family.
//!
//! Batch, replace-table, and replace-partition streams all stage records
//! into a local batch file inside one long-running transaction; they differ
//! in where the staged rows land at commit time. This base owns the
//! transaction, the batch file, and the running coalesced batch schema, and
//! guarantees both are released on every exit path.

use std::sync::Arc;

use bulker_core::batch_file::BatchFileWriter;
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::options::{BulkMode, StreamOptions, StreamState, StreamStatus};
use bulker_core::schema::{managed_pk_name, random_suffix, Table, TEMP_TABLE_PREFIX};
use bulker_core::types::Record;

use crate::adapter::SqlSession;
use crate::destination::Destination;
use crate::stream::core::StreamCore;
use crate::table_helper::coalesce_types;

/// Returns a fresh session-scoped staging table name.
pub(crate) fn temp_table_name() -> String {
    format!("{TEMP_TABLE_PREFIX}{}", random_suffix(8))
}

/// Rebuilds a classified error so it can be both returned from `consume`
/// and replayed verbatim from `complete`.
pub(crate) fn replicate(err: &Error) -> Error {
    Error::backend(err.kind(), err.to_string())
}

/// State shared by the transactional stream modes.
pub(crate) struct TransactionalBase {
    pub core: StreamCore,
    tx: Option<Box<dyn SqlSession + Send + Sync>>,
    batch: Option<BatchFileWriter>,
    pub batch_schema: Table,
    pending_rows: u64,
}

impl TransactionalBase {
    pub fn new(
        dest: Arc<Destination>,
        id: &str,
        table_name: &str,
        mode: BulkMode,
        options: StreamOptions,
    ) -> Self {
        let mut batch_schema = Table::new(table_name);
        batch_schema.pk_fields = options.primary_keys.iter().cloned().collect();
        if !batch_schema.pk_fields.is_empty() {
            batch_schema.pk_name = managed_pk_name();
        }
        if let Some(timestamp_column) = &options.timestamp_column {
            batch_schema.timestamp_column.clone_from(timestamp_column);
        }
        Self {
            core: StreamCore::new(dest, id, table_name, mode, options),
            tx: None,
            batch: None,
            batch_schema,
            pending_rows: 0,
        }
    }

    /// Stages one record: opens the transaction and batch file lazily,
    /// coalesces the record's schema into the batch schema, and appends.
    ///
    /// Errors are remembered in the stream state so `complete` can replay
    /// the last one, per the commit protocol.
    pub async fn consume_record(&mut self, record: Record) -> Result<()> {
        match self.on_record(record).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.core.state.last_error = Some(err.to_string());
                self.core.last_error = Some(replicate(&err));
                Err(err)
            }
        }
    }

    async fn on_record(&mut self, record: Record) -> Result<()> {
        let (table, record) = self.core.preprocess(record)?;
        if self.tx.is_none() {
            self.tx = Some(self.core.dest.adapter().open_tx().await?);
        }
        if self.batch.is_none() {
            let dir = self
                .core
                .options
                .batch_file_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            self.batch = Some(BatchFileWriter::new(
                &dir,
                &self.core.id,
                self.core.dest.batch_file_format(),
            ));
        }
        coalesce_types(&mut self.batch_schema, &table);
        self.core.update_representation(&self.batch_schema);
        self.batch
            .as_mut()
            .expect("batch file just acquired")
            .append(record);
        self.pending_rows += 1;
        Ok(())
    }

    /// Number of rows staged since the last flush.
    pub fn pending_rows(&self) -> u64 {
        self.pending_rows
    }

    /// Creates the staging table for the current chunk and bulk-loads the
    /// pending batch file into it.
    pub async fn stage_pending(&mut self, name: String, temporary: bool) -> Result<Table> {
        let dialect = self.core.dest.adapter().dialect();
        let mut staging = dialect.resolve_types(&self.batch_schema);
        staging.name = name;
        staging.temporary = temporary;
        if !staging.pk_fields.is_empty() {
            staging.pk_name = managed_pk_name();
        }

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "no open transaction"))?;
        tx.create_table(&staging).await?;

        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Load, "no pending batch file"))?;
        let source = batch.flush(&staging)?;
        let loaded = tx.load_table(&staging, &source).await?;
        tracing::debug!(
            stream = %self.core.id,
            staging = %staging.name,
            rows = loaded,
            "loaded batch file into staging table"
        );
        self.release_batch();
        self.pending_rows = 0;
        Ok(staging)
    }

    /// Ensures the destination accepts the accumulated batch schema.
    ///
    /// Uses the uncached ensure: the batch commit must see the live schema,
    /// and replace flows are about to swap the table out from under the
    /// cache anyway.
    pub async fn ensure_destination(&mut self) -> Result<Table> {
        let dialect = self.core.dest.adapter().dialect();
        let helper = self.core.dest.table_helper();
        let mut target = dialect.resolve_types(&self.batch_schema);
        target.name.clone_from(&self.core.table_name);
        target.temporary = false;

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "no open transaction"))?;
        let ensured = helper
            .ensure_table_without_caching(tx.as_mut(), dialect, &target)
            .await?;
        self.core.update_representation(&ensured);
        Ok(ensured)
    }

    /// Re-anchors the accumulated batch schema on the committed destination
    /// types, so staged values are rendered for the types the warehouse
    /// actually holds. Hinted columns stay pinned.
    pub fn align_batch_schema(&mut self, ensured: &Table) {
        for (name, committed) in &ensured.columns {
            if let Some(column) = self.batch_schema.columns.get_mut(name) {
                if !column.override_type {
                    column.data_type = committed.data_type;
                    column.sql_type.clone_from(&committed.sql_type);
                    column.ddl_type.clone_from(&committed.ddl_type);
                }
            }
        }
    }

    /// `INSERT … SELECT` the staged chunk into the destination.
    pub async fn copy_to(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "no open transaction"))?;
        tx.copy_tables(target, source, merge).await
    }

    /// Deletes one partition of the destination inside the transaction.
    pub async fn delete_partition(&mut self, partition_id: &str) -> Result<u64> {
        let table_name = self.core.table_name.clone();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "no open transaction"))?;
        tx.delete_partition(&table_name, partition_id).await
    }

    /// Replaces the destination with the staged sibling, falling back to
    /// keeping the deprecated table when the drop step fails.
    pub async fn replace_destination(&mut self, staging: &Table) -> Result<()> {
        let table_name = self.core.table_name.clone();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "no open transaction"))?;
        match tx.replace_table(&table_name, staging, true).await {
            Err(err) if err.kind() == ErrorKind::Drop => {
                tracing::warn!(
                    table = %table_name,
                    error = %err,
                    "drop of deprecated table failed, leaving it for out-of-band cleanup"
                );
                tx.replace_table(&table_name, staging, false).await
            }
            other => other,
        }
    }

    /// Best-effort drop of a staging table.
    pub async fn drop_best_effort(&mut self, name: &str) {
        if let Some(tx) = self.tx.as_mut() {
            if let Err(err) = tx.drop_table(name, true).await {
                tracing::warn!(table = name, error = %err, "failed to drop staging table");
            }
        }
    }

    /// Commits and releases the open transaction.
    pub async fn commit_tx(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Rolls back and releases the open transaction, best effort.
    pub async fn rollback_tx(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback().await {
                tracing::warn!(stream = %self.core.id, error = %err, "rollback failed");
            }
        }
    }

    /// Unlinks and releases the batch file.
    pub fn release_batch(&mut self) {
        if let Some(mut batch) = self.batch.take() {
            batch.release();
        }
    }

    /// Terminal success: releases every held resource.
    pub fn finish_ok(&mut self) -> StreamState {
        self.release_batch();
        self.core.transition(StreamStatus::Completed);
        self.core.state.clone()
    }

    /// Terminal failure: rolls back, releases resources, and returns the
    /// error for the caller to surface.
    pub async fn finish_err(&mut self, err: Error) -> Error {
        self.rollback_tx().await;
        self.release_batch();
        self.core.fail(&err);
        self.core.transition(StreamStatus::Failed);
        err
    }

    /// Idempotent abort: rollback, release, terminal.
    pub async fn abort(&mut self) -> StreamState {
        if !self.core.state.status.is_terminal() {
            self.rollback_tx().await;
            self.release_batch();
            self.core.transition(StreamStatus::Aborted);
        }
        self.core.state.clone()
    }

    /// Looks up the live destination schema outside the transaction.
    pub async fn destination_schema(&self) -> Result<Table> {
        let mut session = self.core.dest.adapter().open_session().await?;
        session.get_table_schema(&self.core.table_name).await
    }

    /// Truncates the destination outside the transaction.
    pub async fn truncate_destination(&self) -> Result<()> {
        let mut session = self.core.dest.adapter().open_session().await?;
        session.truncate_table(&self.core.table_name).await
    }
}
