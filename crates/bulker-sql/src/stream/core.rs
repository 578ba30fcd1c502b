//! Shared stream internals: the consume prologue and state bookkeeping.

use metrics::counter;
use serde_json::Value;
use std::sync::Arc;

use bulker_core::error::{Error, Recommendation, Result};
use bulker_core::flatten::{DummyFlattener, Flattener, NestedFlattener};
use bulker_core::options::{BulkMode, StreamOptions, StreamState, StreamStatus};
use bulker_core::schema::{managed_pk_name, Column, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, parse_timestamp, reformat, DataType, Record};

use crate::destination::Destination;

/// State shared by every stream mode.
pub(crate) struct StreamCore {
    pub id: String,
    pub table_name: String,
    pub mode: BulkMode,
    pub options: StreamOptions,
    pub dest: Arc<Destination>,
    pub state: StreamState,
    pub last_error: Option<Error>,
    flattener: Box<dyn Flattener>,
}

impl StreamCore {
    pub fn new(
        dest: Arc<Destination>,
        id: &str,
        table_name: &str,
        mode: BulkMode,
        options: StreamOptions,
    ) -> Self {
        let flattener: Box<dyn Flattener> = if dest.adapter().dialect().stores_json_natively {
            Box::new(DummyFlattener)
        } else {
            Box::new(NestedFlattener::new(options.omit_nil_values))
        };
        Self {
            id: id.to_owned(),
            table_name: table_name.to_owned(),
            mode,
            options,
            dest,
            state: StreamState::default(),
            last_error: None,
            flattener,
        }
    }

    /// Fails with `StreamClosed` once the stream is terminal.
    pub fn check_active(&self) -> Result<()> {
        if self.state.status.is_terminal() {
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    /// The consume prologue: flatten, stamp the partition id, narrow value
    /// types, and apply external type hints. Returns the per-record table
    /// alongside the normalized record.
    pub fn preprocess(&self, record: Record) -> Result<(Table, Record)> {
        let mut flat = self.flattener.flatten(record)?;

        if self.mode == BulkMode::ReplacePartition {
            if let Some(partition_id) = &self.options.partition_id {
                flat.insert(
                    PARTITION_ID_COLUMN.to_owned(),
                    Value::String(partition_id.clone()),
                );
            }
        }

        let mut table = Table::new(&self.table_name);
        let mut normalized = Record::new();
        for (key, value) in flat {
            let column = if let Some(hint) = self.options.column_types.get(&key) {
                normalized.insert(key.clone(), value);
                Column {
                    sql_type: hint.sql_type.clone(),
                    ddl_type: hint.ddl_type.clone(),
                    data_type: DataType::Unknown,
                    override_type: true,
                    new: true,
                }
            } else {
                let (data_type, reformatted) = reformat(&value);
                normalized.insert(key.clone(), reformatted);
                let mut column = Column::of(data_type);
                column.new = true;
                column
            };
            table.columns.insert(key, column);
        }

        table.pk_fields = self.options.primary_keys.iter().cloned().collect();
        if !table.pk_fields.is_empty() {
            table.pk_name = managed_pk_name();
        }
        if let Some(timestamp_column) = &self.options.timestamp_column {
            table.timestamp_column.clone_from(timestamp_column);
        }
        Ok((table, normalized))
    }

    /// Counter and status bookkeeping after one consume attempt.
    pub fn post_consume(&mut self, result: Result<()>) -> Result<StreamState> {
        self.state.processed_rows += 1;
        match result {
            Ok(()) => {
                self.state.successful_rows += 1;
                counter!(
                    "bulker_rows_total",
                    "mode" => self.mode.to_string(),
                    "status" => "success"
                )
                .increment(1);
                Ok(self.state.clone())
            }
            Err(err) => {
                counter!(
                    "bulker_rows_total",
                    "mode" => self.mode.to_string(),
                    "status" => "error"
                )
                .increment(1);
                if err.recommendation() == Recommendation::Abort {
                    self.fail(&err);
                } else {
                    tracing::warn!(
                        stream = %self.id,
                        table = %self.table_name,
                        error = %err,
                        "record failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Marks the stream failed with a fatal error.
    pub fn fail(&mut self, err: &Error) {
        tracing::warn!(
            stream = %self.id,
            table = %self.table_name,
            kind = %err.kind(),
            error = %err,
            "stream failed"
        );
        self.state.status = StreamStatus::Failed;
        self.state.last_error = Some(err.to_string());
    }

    /// Records a terminal transition.
    pub fn transition(&mut self, status: StreamStatus) {
        self.state.status = status;
        counter!(
            "bulker_streams_total",
            "mode" => self.mode.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    /// Updates the destination snapshot callers observe through the state.
    pub fn update_representation(&mut self, table: &Table) {
        self.state.representation = Some(table.clone());
    }
}

/// Returns true when `value` (after coercion) can be stored in a column of
/// `data_type`. Mirrors what a typed warehouse accepts per column class.
pub(crate) fn value_fits(value: &Value, data_type: DataType) -> bool {
    let coerced = coerce(value, data_type);
    match data_type {
        DataType::Int64 => match &coerced {
            Value::Null => true,
            Value::Number(n) => n.is_i64() || n.is_u64(),
            _ => false,
        },
        DataType::Float64 => matches!(coerced, Value::Null | Value::Number(_)),
        DataType::Bool => matches!(coerced, Value::Null | Value::Bool(_)),
        DataType::Timestamp => match &coerced {
            Value::Null => true,
            Value::String(s) => parse_timestamp(s).is_some(),
            _ => false,
        },
        DataType::String | DataType::Json | DataType::Unknown => true,
    }
}

/// Splits a record against a destination schema into the fitting part and
/// the mismatching columns. Used by the auto-commit type-collision recovery.
pub(crate) fn split_mismatches(record: &Record, schema: &Table) -> (Record, Vec<String>) {
    let mut fitting = Record::new();
    let mut mismatched = Vec::new();
    for (key, value) in record {
        let data_type = schema
            .columns
            .get(key)
            .map_or(DataType::Unknown, |c| c.data_type);
        if value_fits(value, data_type) {
            fitting.insert(key.clone(), value.clone());
        } else {
            mismatched.push(key.clone());
        }
    }
    (fitting, mismatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_fits_matrix() {
        assert!(value_fits(&json!(7), DataType::Int64));
        assert!(value_fits(&json!("7"), DataType::Int64));
        assert!(!value_fits(&json!("a"), DataType::Int64));
        assert!(value_fits(&json!(3.14), DataType::Float64));
        assert!(!value_fits(&json!("x"), DataType::Bool));
        assert!(value_fits(&json!("2022-08-18T14:17:22Z"), DataType::Timestamp));
        assert!(!value_fits(&json!("yesterday"), DataType::Timestamp));
        assert!(value_fits(&json!(123), DataType::String));
        assert!(value_fits(&Value::Null, DataType::Int64));
    }

    #[test]
    fn split_mismatches_partitions_record() {
        let mut schema = Table::new("t");
        schema
            .columns
            .insert("n".into(), Column::of(DataType::Int64));
        schema
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        let record = json!({"id": 2, "n": "a"}).as_object().unwrap().clone();
        let (fitting, mismatched) = split_mismatches(&record, &schema);
        assert_eq!(fitting.len(), 1);
        assert!(fitting.contains_key("id"));
        assert_eq!(mismatched, vec!["n".to_owned()]);
    }
}
