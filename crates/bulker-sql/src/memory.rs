//! In-memory destination backend.
//!
//! A complete implementation of the adapter contract over process-local
//! state. Not suitable for production; it exists so the stream state machine
//! and the table helper can be exercised end-to-end without a warehouse.
//!
//! Transactional sessions are snapshot-isolated: `open_tx` clones the
//! database, every operation mutates the clone, and `commit` publishes it
//! back. Concurrent transactions are last-commit-wins, which is sufficient
//! for per-table test scenarios.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, parse_timestamp, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::dialect::{deprecated_table_name, Dialect};

#[derive(Debug, Clone)]
struct MemTable {
    schema: Table,
    rows: Vec<Record>,
}

#[derive(Debug, Clone, Default)]
struct MemoryDb {
    tables: HashMap<String, MemTable>,
}

/// In-memory backend for tests.
///
/// Cloning shares the underlying database, so a test can keep a handle for
/// verification while the destination owns another.
#[derive(Clone)]
pub struct MemoryAdapter {
    db: Arc<Mutex<MemoryDb>>,
    dialect: Dialect,
    format: BatchFileFormat,
    fail_next_drop: Arc<AtomicBool>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    /// Creates a backend that behaves like a transactional warehouse with
    /// in-place column widening (the postgres-like profile).
    #[must_use]
    pub fn new() -> Self {
        Self {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            dialect: Dialect::memory(),
            format: BatchFileFormat::Ndjson,
            fail_next_drop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a backend without transactional DDL or column widening
    /// (the bigquery-like profile): type collisions divert instead of
    /// widening.
    #[must_use]
    pub fn without_widening() -> Self {
        let mut adapter = Self::new();
        adapter.dialect.supports_column_widening = false;
        adapter.dialect.supports_transactional_ddl = false;
        adapter
    }

    /// Uses CSV staging files instead of NDJSON.
    #[must_use]
    pub fn with_csv_batches(mut self) -> Self {
        self.format = BatchFileFormat::Csv;
        self
    }

    /// Makes the next `drop_table` fail with the `Drop` kind. Test hook for
    /// the replace-table fallback path.
    pub fn fail_next_drop(&self) {
        self.fail_next_drop.store(true, Ordering::SeqCst);
    }

    /// Returns all table names, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let db = self.db.lock().expect("memory db poisoned");
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SqlAdapter for MemoryAdapter {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        self.format
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn init_database(&self) -> Result<()> {
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(MemorySession {
            db: Arc::clone(&self.db),
            staged: None,
            widening: self.dialect.supports_column_widening,
            fail_next_drop: Arc::clone(&self.fail_next_drop),
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        let snapshot = self.db.lock().expect("memory db poisoned").clone();
        Ok(Box::new(MemorySession {
            db: Arc::clone(&self.db),
            staged: Some(snapshot),
            widening: self.dialect.supports_column_widening,
            fail_next_drop: Arc::clone(&self.fail_next_drop),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySession {
    db: Arc<Mutex<MemoryDb>>,
    staged: Option<MemoryDb>,
    widening: bool,
    fail_next_drop: Arc<AtomicBool>,
}

impl MemorySession {
    fn with_db<R>(&mut self, f: impl FnOnce(&mut MemoryDb) -> R) -> R {
        match &mut self.staged {
            Some(db) => f(db),
            None => f(&mut self.db.lock().expect("memory db poisoned")),
        }
    }

    fn take_drop_failure(&self) -> bool {
        self.fail_next_drop.swap(false, Ordering::SeqCst)
    }
}

/// Validates and stores one row into a table, enforcing column existence and
/// type compatibility the way a typed warehouse would.
fn store_row(mem: &mut MemTable, merge: bool, row: &Record) -> Result<()> {
    for key in row.keys() {
        if !mem.schema.columns.contains_key(key) {
            return Err(Error::backend(
                ErrorKind::MissingColumn,
                format!("column {key} does not exist in table {}", mem.schema.name),
            ));
        }
    }

    let mut stored = Record::new();
    for (name, column) in &mem.schema.columns {
        let value = row.get(name).cloned().unwrap_or(Value::Null);
        let value = coerce(&value, column.data_type);
        check_type(&mem.schema.name, name, column.data_type, &value)?;
        stored.insert(name.clone(), value);
    }

    if merge && !mem.schema.pk_fields.is_empty() {
        let pk_of = |r: &Record| -> Vec<Value> {
            mem.schema
                .pk_fields
                .iter()
                .map(|f| r.get(f).cloned().unwrap_or(Value::Null))
                .collect()
        };
        let key = pk_of(&stored);
        if let Some(existing) = mem.rows.iter_mut().find(|r| pk_of(&**r) == key) {
            for (name, value) in stored {
                existing.insert(name, value);
            }
            return Ok(());
        }
    }
    mem.rows.push(stored);
    Ok(())
}

fn check_type(table: &str, column: &str, data_type: DataType, value: &Value) -> Result<()> {
    let ok = match data_type {
        DataType::Int64 => match value {
            Value::Null => true,
            Value::Number(n) => n.is_i64() || n.is_u64(),
            _ => false,
        },
        DataType::Float64 => matches!(value, Value::Null | Value::Number(_)),
        DataType::Bool => matches!(value, Value::Null | Value::Bool(_)),
        DataType::Timestamp => match value {
            Value::Null => true,
            Value::String(s) => parse_timestamp(s).is_some(),
            _ => false,
        },
        DataType::String => matches!(value, Value::Null | Value::String(_)),
        DataType::Json | DataType::Unknown => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::backend(
            ErrorKind::TypeMismatch,
            format!("column {column}: value {value} does not fit {data_type} in table {table}"),
        ))
    }
}

/// Parses one line of a quoted CSV row into optional fields.
fn parse_csv_line(line: &str) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        match chars.peek() {
            None => {
                fields.push(None);
                break;
            }
            Some(',') => {
                chars.next();
                fields.push(None);
                if chars.peek().is_none() {
                    fields.push(None);
                    break;
                }
            }
            Some('"') => {
                chars.next();
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                field.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(c) => field.push(c),
                        None => break,
                    }
                }
                fields.push(Some(field));
                match chars.next() {
                    Some(',') => {
                        if chars.peek().is_none() {
                            fields.push(None);
                            break;
                        }
                    }
                    _ => break,
                }
            }
            Some(_) => {
                // unquoted field, read to the next comma
                let mut field = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    field.push(c);
                    chars.next();
                }
                fields.push(Some(field));
                match chars.next() {
                    Some(',') => {
                        if chars.peek().is_none() {
                            fields.push(None);
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }
    fields
}

fn csv_value(field: Option<String>, data_type: DataType) -> Value {
    match field {
        None => Value::Null,
        Some(text) => match data_type {
            DataType::Int64 => text
                .parse::<i64>()
                .map_or_else(|_| Value::String(text), Value::from),
            DataType::Float64 => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| Value::String(text.clone()), Value::Number),
            DataType::Bool => {
                if text == "true" {
                    Value::Bool(true)
                } else if text == "false" {
                    Value::Bool(false)
                } else {
                    Value::String(text)
                }
            }
            _ => Value::String(text),
        },
    }
}

#[async_trait]
impl SqlSession for MemorySession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let name = table_name.to_owned();
        Ok(self.with_db(|db| {
            db.tables
                .get(&name)
                .map_or_else(|| Table::new(&name), |mem| mem.schema.clone())
        }))
    }

    async fn create_table(&mut self, table: &Table) -> Result<()> {
        let table = table.clone();
        self.with_db(|db| {
            db.tables.entry(table.name.clone()).or_insert(MemTable {
                schema: table,
                rows: Vec::new(),
            });
        });
        Ok(())
    }

    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()> {
        let patch = patch.clone();
        self.with_db(|db| {
            let mem = db.tables.get_mut(&patch.name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {} does not exist", patch.name),
                )
            })?;
            for (name, column) in &patch.columns {
                mem.schema
                    .columns
                    .entry(name.clone())
                    .or_insert_with(|| column.clone());
                for row in &mut mem.rows {
                    row.entry(name.clone()).or_insert(Value::Null);
                }
            }
            if patch.delete_pk_fields {
                mem.schema.pk_fields.clear();
                mem.schema.pk_name.clear();
            }
            if !patch.pk_fields.is_empty() {
                mem.schema.pk_fields = patch.pk_fields.clone();
                mem.schema.pk_name = patch.pk_name.clone();
            }
            Ok(())
        })
    }

    async fn insert(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        let name = table.name.clone();
        let rows = rows.to_vec();
        self.with_db(|db| {
            let mem = db.tables.get_mut(&name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )
            })?;
            for row in &rows {
                store_row(mem, merge, row)?;
            }
            Ok(())
        })
    }

    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let target_name = target.name.clone();
        let source_name = source.name.clone();
        self.with_db(|db| {
            let source_rows = db
                .tables
                .get(&source_name)
                .ok_or_else(|| {
                    Error::backend(
                        ErrorKind::MissingTable,
                        format!("table {source_name} does not exist"),
                    )
                })?
                .rows
                .clone();
            let mem = db.tables.get_mut(&target_name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {target_name} does not exist"),
                )
            })?;
            let mut copied = 0;
            for row in source_rows {
                // drop explicit nulls so merges only overwrite present columns
                let present: Record = row.into_iter().filter(|(_, v)| !v.is_null()).collect();
                store_row(mem, merge, &present)?;
                copied += 1;
            }
            Ok(copied)
        })
    }

    async fn load_table(&mut self, target: &Table, source: &LoadSource) -> Result<u64> {
        let LoadSource::LocalFile { path, format } = source else {
            return Err(Error::backend(
                ErrorKind::Load,
                "memory backend loads local files only",
            ));
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read batch file {}", path.display()), e))?;

        let mut rows: Vec<Record> = Vec::new();
        match format {
            BatchFileFormat::Ndjson => {
                for line in contents.lines().filter(|l| !l.is_empty()) {
                    let row: Record =
                        serde_json::from_str(line).map_err(|e| Error::Serialization {
                            message: format!("parse staged row: {e}"),
                        })?;
                    rows.push(row);
                }
            }
            BatchFileFormat::Csv => {
                let mut lines = contents.lines().filter(|l| !l.is_empty());
                let header: Vec<String> = parse_csv_line(lines.next().unwrap_or_default())
                    .into_iter()
                    .map(Option::unwrap_or_default)
                    .collect();
                for line in lines {
                    let fields = parse_csv_line(line);
                    let mut row = Record::new();
                    for (i, name) in header.iter().enumerate() {
                        let data_type = target
                            .columns
                            .get(name)
                            .map_or(DataType::String, |c| c.data_type);
                        let value = csv_value(fields.get(i).cloned().flatten(), data_type);
                        if !value.is_null() {
                            row.insert(name.clone(), value);
                        }
                    }
                    rows.push(row);
                }
            }
        }

        let count = rows.len() as u64;
        self.insert(target, false, &rows).await?;
        Ok(count)
    }

    async fn replace_table(
        &mut self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        let target_name = target_name.to_owned();
        let replacement_name = replacement.name.clone();
        let already_swapped = self.with_db(|db| {
            !db.tables.contains_key(&replacement_name) && db.tables.contains_key(&target_name)
        });
        if already_swapped {
            return Ok(());
        }
        let deprecated = self.with_db(|db| {
            let deprecated = if db.tables.contains_key(&target_name) {
                let deprecated = deprecated_table_name(&target_name);
                if let Some(mut mem) = db.tables.remove(&target_name) {
                    mem.schema.name.clone_from(&deprecated);
                    db.tables.insert(deprecated.clone(), mem);
                }
                Some(deprecated)
            } else {
                None
            };
            if let Some(mut mem) = db.tables.remove(&replacement_name) {
                mem.schema.name.clone_from(&target_name);
                db.tables.insert(target_name.clone(), mem);
            }
            deprecated
        });
        if drop_old {
            if let Some(deprecated) = deprecated {
                self.drop_table(&deprecated, true).await?;
            }
        }
        Ok(())
    }

    async fn truncate_table(&mut self, table_name: &str) -> Result<()> {
        let name = table_name.to_owned();
        self.with_db(|db| {
            let mem = db.tables.get_mut(&name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )
            })?;
            mem.rows.clear();
            Ok(())
        })
    }

    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()> {
        if self.take_drop_failure() {
            return Err(Error::backend(
                ErrorKind::Drop,
                format!("injected drop failure for {table_name}"),
            ));
        }
        let name = table_name.to_owned();
        self.with_db(|db| {
            let removed = db.tables.remove(&name).is_some();
            if !removed && !if_exists {
                return Err(Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                ));
            }
            Ok(())
        })
    }

    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64> {
        let name = table_name.to_owned();
        let partition_id = partition_id.to_owned();
        self.with_db(|db| {
            let mem = db.tables.get_mut(&name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )
            })?;
            let before = mem.rows.len();
            mem.rows.retain(|row| {
                row.get(PARTITION_ID_COLUMN)
                    .and_then(Value::as_str)
                    .map_or(true, |v| v != partition_id)
            });
            Ok((before - mem.rows.len()) as u64)
        })
    }

    async fn widen_column_to_string(&mut self, table_name: &str, column: &str) -> Result<()> {
        if !self.widening {
            return Err(Error::backend(
                ErrorKind::Syntax,
                "backend does not support column widening",
            ));
        }
        let name = table_name.to_owned();
        let column = column.to_owned();
        self.with_db(|db| {
            let mem = db.tables.get_mut(&name).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )
            })?;
            let col = mem.schema.columns.get_mut(&column).ok_or_else(|| {
                Error::backend(
                    ErrorKind::MissingColumn,
                    format!("column {column} does not exist in table {name}"),
                )
            })?;
            col.data_type = DataType::String;
            col.sql_type = "text".into();
            for row in &mut mem.rows {
                if let Some(value) = row.get_mut(&column) {
                    *value = coerce(value, DataType::String);
                }
            }
            Ok(())
        })
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let name = table_name.to_owned();
        self.with_db(|db| {
            db.tables.get(&name).map_or(
                Err(Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )),
                |mem| Ok(mem.rows.len() as u64),
            )
        })
    }

    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>> {
        let name = table_name.to_owned();
        self.with_db(|db| {
            db.tables.get(&name).map_or(
                Err(Error::backend(
                    ErrorKind::MissingTable,
                    format!("table {name} does not exist"),
                )),
                |mem| Ok(mem.rows.clone()),
            )
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(mut staged) = self.staged {
            staged.tables.retain(|_, mem| !mem.schema.temporary);
            *self.db.lock().expect("memory db poisoned") = staged;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulker_core::schema::Column;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().expect("object").clone()
    }

    fn events_table() -> Table {
        let mut t = Table::new("events");
        t.columns
            .insert("id".into(), Column::of(DataType::Int64));
        t.columns
            .insert("v".into(), Column::of(DataType::String));
        t
    }

    #[tokio::test]
    async fn insert_and_select_roundtrip() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let table = events_table();
        session.create_table(&table).await.unwrap();
        session
            .insert(&table, false, &[record(json!({"id": 1, "v": "a"}))])
            .await
            .unwrap();

        let rows = session.select_all("events").await.unwrap();
        assert_eq!(rows, vec![record(json!({"id": 1, "v": "a"}))]);
        assert_eq!(session.count("events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_type_mismatch() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let table = events_table();
        session.create_table(&table).await.unwrap();
        let err = session
            .insert(&table, false, &[record(json!({"id": "not-a-number"}))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[tokio::test]
    async fn insert_rejects_unknown_columns() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let table = events_table();
        session.create_table(&table).await.unwrap();
        let err = session
            .insert(&table, false, &[record(json!({"id": 1, "missing": 2}))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingColumn);
    }

    #[tokio::test]
    async fn merge_updates_by_primary_key() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let mut table = events_table();
        table.pk_fields.insert("id".into());
        session.create_table(&table).await.unwrap();
        session
            .insert(&table, true, &[record(json!({"id": 1, "v": "a"}))])
            .await
            .unwrap();
        session
            .insert(&table, true, &[record(json!({"id": 1, "v": "b"}))])
            .await
            .unwrap();

        let rows = session.select_all("events").await.unwrap();
        assert_eq!(rows, vec![record(json!({"id": 1, "v": "b"}))]);
    }

    #[tokio::test]
    async fn tx_is_snapshot_isolated() {
        let adapter = MemoryAdapter::new();
        let table = events_table();

        let mut tx = adapter.open_tx().await.unwrap();
        tx.create_table(&table).await.unwrap();
        tx.insert(&table, false, &[record(json!({"id": 1}))])
            .await
            .unwrap();

        // not visible outside the transaction yet
        let mut outside = adapter.open_session().await.unwrap();
        let schema = outside.get_table_schema("events").await.unwrap();
        assert!(!schema.exists());

        tx.commit().await.unwrap();
        assert_eq!(outside.count("events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commit_drops_temporary_tables() {
        let adapter = MemoryAdapter::new();
        let mut tx = adapter.open_tx().await.unwrap();
        let mut temp = events_table();
        temp.name = "jitsu_tmp_abc".into();
        temp.temporary = true;
        tx.create_table(&temp).await.unwrap();
        tx.commit().await.unwrap();
        assert!(adapter.table_names().is_empty());
    }

    #[tokio::test]
    async fn replace_table_survives_drop_failure() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let table = events_table();
        session.create_table(&table).await.unwrap();
        let mut staging = events_table();
        staging.name = "events_tmp_1".into();
        session.create_table(&staging).await.unwrap();
        session
            .insert(&staging, false, &[record(json!({"id": 9, "v": "x"}))])
            .await
            .unwrap();

        adapter.fail_next_drop();
        let err = session
            .replace_table("events", &staging, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Drop);

        // the swap itself completed
        let rows = session.select_all("events").await.unwrap();
        assert_eq!(rows, vec![record(json!({"id": 9, "v": "x"}))]);
        assert!(adapter
            .table_names()
            .iter()
            .any(|n| n.starts_with("deprecated_events_")));
    }

    #[tokio::test]
    async fn delete_partition_scopes_by_reserved_column() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let mut table = events_table();
        table
            .columns
            .insert(PARTITION_ID_COLUMN.into(), Column::of(DataType::String));
        session.create_table(&table).await.unwrap();
        session
            .insert(
                &table,
                false,
                &[
                    record(json!({"id": 1, "__partition_id": "2024-01-01"})),
                    record(json!({"id": 2, "__partition_id": "2024-01-02"})),
                ],
            )
            .await
            .unwrap();

        let deleted = session
            .delete_partition("events", "2024-01-01")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(session.count("events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn widen_column_converts_existing_rows() {
        let adapter = MemoryAdapter::new();
        let mut session = adapter.open_session().await.unwrap();
        let table = events_table();
        session.create_table(&table).await.unwrap();
        session
            .insert(&table, false, &[record(json!({"id": 1}))])
            .await
            .unwrap();

        session
            .widen_column_to_string("events", "id")
            .await
            .unwrap();
        let rows = session.select_all("events").await.unwrap();
        assert_eq!(rows[0]["id"], json!("1"));
    }

    #[test]
    fn csv_line_parsing() {
        assert_eq!(
            parse_csv_line("\"a\",\"b\"\"c\",,\"d\""),
            vec![
                Some("a".into()),
                Some("b\"c".into()),
                None,
                Some("d".into())
            ]
        );
        assert_eq!(parse_csv_line("\"x\","), vec![Some("x".into()), None]);
    }
}
