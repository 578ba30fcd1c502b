//! The stream state machine.
//!
//! A stream is one logical producer writing to one destination table under
//! one [`BulkMode`]. All four modes share the consume prologue (flatten,
//! infer, apply hints, coalesce against the running batch schema) and the
//! commit/abort protocol; what differs is where records land and what
//! `complete` does:
//!
//! - **`AutoCommit`**: each record is applied to the live destination in its
//!   own implicit transaction.
//! - **`Batch`**: records stage into a batch file, loaded into a temp table
//!   and copied into the destination inside one transaction at complete.
//! - **`ReplaceTable`**: like batch, but staged into a named sibling table
//!   that atomically replaces the destination.
//! - **`ReplacePartition`**: like batch, scoped to one partition id which is
//!   deleted and refilled.

use async_trait::async_trait;
use std::sync::Arc;

use bulker_core::error::Result;
use bulker_core::options::{BulkMode, StreamOptions, StreamState};
use bulker_core::types::Record;

use crate::destination::Destination;

mod auto_commit;
mod base;
mod core;
mod replace_partition;
mod replace_table;
mod transactional;

pub(crate) use auto_commit::AutoCommitStream;
pub(crate) use replace_partition::ReplacePartitionStream;
pub(crate) use replace_table::ReplaceTableStream;
pub(crate) use transactional::TransactionalStream;

/// One logical producer writing to one destination table.
///
/// `consume` is serial: callers must not interleave calls on one stream.
#[async_trait]
pub trait BulkerStream: Send {
    /// Consumes one record.
    ///
    /// # Errors
    ///
    /// Per-record errors are returned without terminating the stream; only
    /// errors whose classification recommends aborting flip the stream to
    /// `Failed`. The current state remains queryable via
    /// [`state`](Self::state).
    async fn consume(&mut self, record: Record) -> Result<StreamState>;

    /// Completes the stream, committing staged work. Terminal.
    ///
    /// # Errors
    ///
    /// Returns the stream's `last_error` verbatim when one is set, or the
    /// error of the failed commit sequence; either way the stream rolls
    /// back and transitions to `Failed`.
    async fn complete(&mut self) -> Result<StreamState>;

    /// Aborts the stream, rolling back staged work. Terminal, idempotent.
    async fn abort(&mut self) -> StreamState;

    /// Returns a snapshot of the stream state.
    fn state(&self) -> StreamState;
}

impl std::fmt::Debug for dyn BulkerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkerStream").field("state", &self.state()).finish()
    }
}

/// Creates a stream in the requested mode.
pub(crate) fn create(
    dest: Arc<Destination>,
    id: &str,
    table_name: &str,
    mode: BulkMode,
    options: StreamOptions,
) -> Result<Box<dyn BulkerStream>> {
    options.validate(mode)?;
    Ok(match mode {
        BulkMode::AutoCommit => Box::new(AutoCommitStream::new(dest, id, table_name, options)?),
        BulkMode::Batch => Box::new(TransactionalStream::new(dest, id, table_name, options)),
        BulkMode::ReplaceTable => Box::new(ReplaceTableStream::new(dest, id, table_name, options)),
        BulkMode::ReplacePartition => {
            Box::new(ReplacePartitionStream::new(dest, id, table_name, options))
        }
    })
}
