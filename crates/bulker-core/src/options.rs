//! Stream modes, options, and observable state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::schema::{Table, TypeHints};

/// Delivery mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    /// One transaction per record, applied to the live destination.
    #[serde(rename = "stream")]
    AutoCommit,
    /// One transaction per batch, staged through a temp table.
    Batch,
    /// Batch staged into a sibling table, then atomically swapped in.
    ReplaceTable,
    /// Batch that replaces exactly one partition of the destination.
    ReplacePartition,
}

impl fmt::Display for BulkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoCommit => "stream",
            Self::Batch => "batch",
            Self::ReplaceTable => "replace_table",
            Self::ReplacePartition => "replace_partition",
        };
        f.write_str(s)
    }
}

/// Options recognized at stream creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// Deduplicate on the primary keys using the backend's native upsert.
    pub merge: bool,
    /// Primary-key column names.
    pub primary_keys: Vec<String>,
    /// Partition id for replace-partition mode.
    pub partition_id: Option<String>,
    /// Column carrying the event timestamp.
    pub timestamp_column: Option<String>,
    /// Externally supplied SQL types, overriding inference.
    pub column_types: TypeHints,
    /// When non-zero, batch modes commit an intermediate chunk every N
    /// records instead of one batch per stream.
    pub batch_size: usize,
    /// Omit nil values while flattening.
    pub omit_nil_values: bool,
    /// Named adapter override for destinations exposing several.
    pub bulker_adapter: Option<String>,
    /// Directory for batch staging files; the OS temp dir when unset.
    pub batch_file_dir: Option<PathBuf>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            merge: false,
            primary_keys: Vec::new(),
            partition_id: None,
            timestamp_column: None,
            column_types: TypeHints::default(),
            batch_size: 0,
            omit_nil_values: true,
            bulker_adapter: None,
            batch_file_dir: None,
        }
    }
}

impl StreamOptions {
    /// Validates the option set against the requested mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] for inconsistent combinations.
    pub fn validate(&self, mode: BulkMode) -> Result<()> {
        if mode == BulkMode::ReplacePartition && self.partition_id.is_none() {
            return Err(Error::InvalidOptions {
                message: "replace_partition requires partitionId".into(),
            });
        }
        if self.merge && self.primary_keys.is_empty() {
            return Err(Error::InvalidOptions {
                message: "merge requires primaryKeys".into(),
            });
        }
        Ok(())
    }
}

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Accepting records.
    #[default]
    Active,
    /// Completed successfully; terminal.
    Completed,
    /// Aborted by the caller; terminal.
    Aborted,
    /// Failed with a fatal error; terminal.
    Failed,
}

impl StreamStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Observable state of a stream, returned by every stream operation.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Lifecycle status.
    pub status: StreamStatus,
    /// Message of the last classified error, if any.
    pub last_error: Option<String>,
    /// Records handed to `Consume`.
    pub processed_rows: u64,
    /// Records accepted into the destination (or staged for commit).
    pub successful_rows: u64,
    /// Snapshot of the destination table as the stream last saw it.
    pub representation: Option<Table>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&BulkMode::AutoCommit).unwrap(),
            "\"stream\""
        );
        assert_eq!(
            serde_json::to_string(&BulkMode::ReplacePartition).unwrap(),
            "\"replace_partition\""
        );
        let parsed: BulkMode = serde_json::from_str("\"batch\"").unwrap();
        assert_eq!(parsed, BulkMode::Batch);
    }

    #[test]
    fn replace_partition_requires_partition_id() {
        let options = StreamOptions::default();
        assert!(options.validate(BulkMode::Batch).is_ok());
        assert!(options.validate(BulkMode::ReplacePartition).is_err());

        let options = StreamOptions {
            partition_id: Some("2024-01-01".into()),
            ..StreamOptions::default()
        };
        assert!(options.validate(BulkMode::ReplacePartition).is_ok());
    }

    #[test]
    fn merge_requires_primary_keys() {
        let options = StreamOptions {
            merge: true,
            ..StreamOptions::default()
        };
        assert!(options.validate(BulkMode::Batch).is_err());

        let options = StreamOptions {
            merge: true,
            primary_keys: vec!["id".into()],
            ..StreamOptions::default()
        };
        assert!(options.validate(BulkMode::Batch).is_ok());
    }

    #[test]
    fn default_options_omit_nils() {
        let options: StreamOptions = serde_json::from_str("{}").unwrap();
        assert!(options.omit_nil_values);
        assert_eq!(options.batch_size, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!StreamStatus::Active.is_terminal());
        assert!(StreamStatus::Completed.is_terminal());
        assert!(StreamStatus::Aborted.is_terminal());
        assert!(StreamStatus::Failed.is_terminal());
    }
}
