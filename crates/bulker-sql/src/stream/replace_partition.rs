//! Replace-partition mode: delete one partition, refill it from the batch.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;

use bulker_core::error::Result;
use bulker_core::options::{BulkMode, StreamOptions, StreamState};
use bulker_core::types::Record;

use crate::destination::Destination;
use crate::stream::base::{temp_table_name, TransactionalBase};
use crate::stream::BulkerStream;

/// Replace-partition stream.
///
/// Every record is stamped with the stream's partition id in the reserved
/// partition column. At commit time the transaction first deletes the
/// destination rows of that partition, then copies the staged temp table
/// in; rows of other partitions are untouched.
pub(crate) struct ReplacePartitionStream {
    base: TransactionalBase,
    partition_deleted: bool,
}

impl ReplacePartitionStream {
    pub fn new(
        dest: Arc<Destination>,
        id: &str,
        table_name: &str,
        options: StreamOptions,
    ) -> Self {
        Self {
            base: TransactionalBase::new(dest, id, table_name, BulkMode::ReplacePartition, options),
            partition_deleted: false,
        }
    }

    async fn commit_chunk(&mut self) -> Result<()> {
        let destination = self.base.ensure_destination().await?;
        self.base.align_batch_schema(&destination);
        let temp = self.base.stage_pending(temp_table_name(), true).await?;
        if !self.partition_deleted {
            let partition_id = self
                .base
                .core
                .options
                .partition_id
                .clone()
                .unwrap_or_default();
            let deleted = self.base.delete_partition(&partition_id).await?;
            tracing::debug!(
                stream = %self.base.core.id,
                table = %destination.name,
                partition = %partition_id,
                rows = deleted,
                "cleared destination partition"
            );
            self.partition_deleted = true;
        }
        self.base.copy_to(&destination, &temp, false).await?;
        self.base.drop_best_effort(&temp.name).await;
        self.base.commit_tx().await?;
        counter!("bulker_batches_total", "mode" => "replace_partition").increment(1);
        Ok(())
    }
}

#[async_trait]
impl BulkerStream for ReplacePartitionStream {
    async fn consume(&mut self, record: Record) -> Result<StreamState> {
        self.base.core.check_active()?;
        let result = self.base.consume_record(record).await;
        let state = self.base.core.post_consume(result)?;

        let batch_size = self.base.core.options.batch_size as u64;
        if batch_size > 0 && self.base.pending_rows() >= batch_size {
            if let Err(err) = self.commit_chunk().await {
                return Err(self.base.finish_err(err).await);
            }
        }
        Ok(state)
    }

    async fn complete(&mut self) -> Result<StreamState> {
        self.base.core.check_active()?;

        if self.base.core.state.successful_rows > 0 {
            let result = if self.base.pending_rows() > 0 {
                self.commit_chunk().await
            } else {
                self.base.commit_tx().await
            };
            match result {
                Ok(()) => Ok(self.base.finish_ok()),
                Err(err) => Err(self.base.finish_err(err).await),
            }
        } else if let Some(err) = self.base.core.last_error.take() {
            Err(self.base.finish_err(err).await)
        } else {
            self.base.rollback_tx().await;
            Ok(self.base.finish_ok())
        }
    }

    async fn abort(&mut self) -> StreamState {
        self.base.abort().await
    }

    fn state(&self) -> StreamState {
        self.base.core.state.clone()
    }
}
