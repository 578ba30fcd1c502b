//! Replace-table mode: stage into a named sibling, then atomically swap.

use async_trait::async_trait;
use std::sync::Arc;

use bulker_core::error::Result;
use bulker_core::options::{BulkMode, StreamOptions, StreamState};
use bulker_core::types::Record;

use crate::destination::Destination;
use crate::dialect::staging_table_name;
use crate::stream::base::TransactionalBase;
use crate::stream::BulkerStream;

/// Replace-table stream.
///
/// Records stage into a `<table>_tmp_<ts>` sibling, a regular table, since
/// session-scoped temp tables cannot survive into the rename. `complete`
/// swaps the sibling in place of the destination, keeping the deprecated
/// table when its drop fails. A stream that consumed nothing truncates the
/// existing destination instead: the replace semantics demand an empty
/// table, with the original schema preserved.
///
/// Any record error aborts the whole replace: a partial swap would publish
/// an incomplete table.
pub(crate) struct ReplaceTableStream {
    base: TransactionalBase,
}

impl ReplaceTableStream {
    pub fn new(
        dest: Arc<Destination>,
        id: &str,
        table_name: &str,
        options: StreamOptions,
    ) -> Self {
        Self {
            base: TransactionalBase::new(dest, id, table_name, BulkMode::ReplaceTable, options),
        }
    }

    async fn swap_in(&mut self) -> Result<()> {
        let staging_name = staging_table_name(&self.base.core.table_name);
        let staging = self.base.stage_pending(staging_name, false).await?;
        self.base.replace_destination(&staging).await?;
        self.base.commit_tx().await
    }

    async fn truncate_existing(&mut self) -> Result<()> {
        let table = self.base.destination_schema().await?;
        if table.exists() {
            self.base.truncate_destination().await?;
        }
        self.base.rollback_tx().await;
        Ok(())
    }
}

#[async_trait]
impl BulkerStream for ReplaceTableStream {
    async fn consume(&mut self, record: Record) -> Result<StreamState> {
        self.base.core.check_active()?;
        let result = self.base.consume_record(record).await;
        self.base.core.post_consume(result)
    }

    async fn complete(&mut self) -> Result<StreamState> {
        self.base.core.check_active()?;

        if let Some(err) = self.base.core.last_error.take() {
            return Err(self.base.finish_err(err).await);
        }

        let result = if self.base.core.state.successful_rows > 0 {
            self.swap_in().await
        } else {
            self.truncate_existing().await
        };
        match result {
            Ok(()) => Ok(self.base.finish_ok()),
            Err(err) => Err(self.base.finish_err(err).await),
        }
    }

    async fn abort(&mut self) -> StreamState {
        self.base.abort().await
    }

    fn state(&self) -> StreamState {
        self.base.core.state.clone()
    }
}
