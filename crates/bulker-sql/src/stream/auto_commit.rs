//! Auto-commit mode: one implicit transaction per record.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::options::{BulkMode, StreamOptions, StreamState, StreamStatus};
use bulker_core::schema::{Column, Table, UNMAPPED_DATA_COLUMN};
use bulker_core::types::{DataType, Record};

use crate::adapter::SqlSession;
use crate::destination::Destination;
use crate::stream::core::{split_mismatches, StreamCore};
use crate::stream::BulkerStream;

/// Auto-commit stream: every record is ensured and inserted against the
/// live destination as it arrives. A failed record is reported and the next
/// record proceeds.
pub(crate) struct AutoCommitStream {
    core: StreamCore,
    session: Option<Box<dyn SqlSession + Send + Sync>>,
}

impl AutoCommitStream {
    pub fn new(
        dest: Arc<Destination>,
        id: &str,
        table_name: &str,
        options: StreamOptions,
    ) -> Result<Self> {
        if !dest.adapter().supports_autocommit() {
            return Err(Error::AutocommitUnsupported {
                backend: dest.adapter().backend().to_string(),
            });
        }
        Ok(Self {
            core: StreamCore::new(dest, id, table_name, BulkMode::AutoCommit, options),
            session: None,
        })
    }

    async fn apply(
        core: &mut StreamCore,
        session: &mut Box<dyn SqlSession + Send + Sync>,
        record: Record,
    ) -> Result<()> {
        let (table, record) = core.preprocess(record)?;
        let dest = Arc::clone(&core.dest);
        let dialect = dest.adapter().dialect();
        let helper = dest.table_helper();
        let merge = !table.pk_fields.is_empty();

        let ensured = helper
            .ensure_table(session.as_mut(), dialect, &table)
            .await?;
        core.update_representation(&ensured);

        match session
            .insert(&ensured, merge, std::slice::from_ref(&record))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match err.kind() {
                // schema drifted under the cache: re-ensure and retry once
                ErrorKind::MissingTable | ErrorKind::MissingColumn => {
                    helper.invalidate(&table.name);
                    let ensured = helper
                        .ensure_table(session.as_mut(), dialect, &table)
                        .await?;
                    core.update_representation(&ensured);
                    session
                        .insert(&ensured, merge, std::slice::from_ref(&record))
                        .await
                }
                ErrorKind::TypeMismatch => {
                    Self::recover_type_mismatch(core, session, &table, &ensured, record, err).await
                }
                _ => Err(err),
            },
        }
    }

    /// The type-collision recovery ladder: widen the offending columns to
    /// the string type and retry once; if the backend cannot widen (or the
    /// retry fails), divert the offending fields into the reserved
    /// `_unmapped_data` JSON column and succeed the row.
    async fn recover_type_mismatch(
        core: &mut StreamCore,
        session: &mut Box<dyn SqlSession + Send + Sync>,
        table: &Table,
        ensured: &Table,
        record: Record,
        original: Error,
    ) -> Result<()> {
        let (_, mismatched) = split_mismatches(&record, ensured);
        if mismatched.is_empty() {
            return Err(original);
        }
        let dest = Arc::clone(&core.dest);
        let dialect = dest.adapter().dialect();
        let helper = dest.table_helper();
        let merge = !table.pk_fields.is_empty();

        if dialect.supports_column_widening {
            let mut widened = ensured.clone();
            for column in &mismatched {
                session
                    .widen_column_to_string(&ensured.name, column)
                    .await?;
                if let Some(c) = widened.columns.get_mut(column) {
                    c.data_type = DataType::String;
                    c.sql_type = dialect.sql_type(DataType::String).to_owned();
                }
            }
            helper.invalidate(&ensured.name);
            core.update_representation(&widened);
            tracing::info!(
                table = %ensured.name,
                columns = ?mismatched,
                "widened columns to string after type collision"
            );
            match session
                .insert(&widened, merge, std::slice::from_ref(&record))
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        table = %ensured.name,
                        error = %err,
                        "retry after widening failed, diverting record"
                    );
                }
            }
        }

        Self::divert(core, session, table, record, &mismatched).await
    }

    async fn divert(
        core: &mut StreamCore,
        session: &mut Box<dyn SqlSession + Send + Sync>,
        table: &Table,
        mut record: Record,
        mismatched: &[String],
    ) -> Result<()> {
        let dest = Arc::clone(&core.dest);
        let dialect = dest.adapter().dialect();
        let helper = dest.table_helper();
        let merge = !table.pk_fields.is_empty();

        let mut unmapped = Record::new();
        for column in mismatched {
            if let Some(value) = record.get(column).cloned() {
                unmapped.insert(dialect.fold(column), value);
                record.insert(column.clone(), Value::Null);
            }
        }
        let encoded = serde_json::to_string(&unmapped).map_err(|e| Error::Serialization {
            message: format!("encode unmapped fields: {e}"),
        })?;
        record.insert(UNMAPPED_DATA_COLUMN.to_owned(), Value::String(encoded));

        let mut with_unmapped = table.clone();
        let mut column = Column::of(DataType::Json);
        column.new = true;
        with_unmapped
            .columns
            .insert(UNMAPPED_DATA_COLUMN.to_owned(), column);

        let ensured = helper
            .ensure_table(session.as_mut(), dialect, &with_unmapped)
            .await?;
        core.update_representation(&ensured);
        session
            .insert(&ensured, merge, std::slice::from_ref(&record))
            .await
    }
}

#[async_trait]
impl BulkerStream for AutoCommitStream {
    async fn consume(&mut self, record: Record) -> Result<StreamState> {
        self.core.check_active()?;
        if self.session.is_none() {
            self.session = Some(self.core.dest.adapter().open_session().await?);
        }
        let session = self.session.as_mut().expect("session just opened");
        let result = Self::apply(&mut self.core, session, record).await;
        self.core.post_consume(result)
    }

    async fn complete(&mut self) -> Result<StreamState> {
        self.core.check_active()?;
        self.session = None;
        self.core.transition(StreamStatus::Completed);
        Ok(self.core.state.clone())
    }

    async fn abort(&mut self) -> StreamState {
        if !self.core.state.status.is_terminal() {
            self.session = None;
            self.core.transition(StreamStatus::Aborted);
        }
        self.core.state.clone()
    }

    fn state(&self) -> StreamState {
        self.core.state.clone()
    }
}
