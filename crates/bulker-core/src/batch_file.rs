//! Local batch staging files.
//!
//! Batch-mode streams accumulate rows into one append-only local file per
//! stream, flushed as a single bulk load at commit time. The format follows
//! what the destination can load natively: CSV when the backend has a CSV
//! bulk path, NDJSON otherwise.
//!
//! Wire formats:
//! - NDJSON: one JSON object per line, keys in sorted order.
//! - CSV: header of quoted column names in sorted order; every field quoted,
//!   `"` escaped by doubling, rows `\n`-terminated.
//!
//! The file is scoped to the stream: acquired on first use and unconditionally
//! unlinked on any terminal transition.

use serde_json::Value;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::schema::Table;
use crate::types::{coerce, Record};

/// Format of a batch staging file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFileFormat {
    /// Comma-separated values with a header line.
    Csv,
    /// Newline-delimited JSON objects.
    Ndjson,
}

impl BatchFileFormat {
    /// Returns the file extension for this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Ndjson => "ndjson",
        }
    }
}

/// A staged source of rows handed to an adapter's bulk-load operation.
#[derive(Debug, Clone)]
pub enum LoadSource {
    /// A local file written by [`BatchFileWriter`].
    LocalFile {
        /// Path of the staged file.
        path: PathBuf,
        /// File format.
        format: BatchFileFormat,
    },
    /// An object already staged in S3 (Redshift `COPY`).
    S3 {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Bucket region.
        region: String,
        /// Object format.
        format: BatchFileFormat,
    },
}

impl LoadSource {
    /// Returns the format of the staged rows.
    #[must_use]
    pub const fn format(&self) -> BatchFileFormat {
        match self {
            Self::LocalFile { format, .. } | Self::S3 { format, .. } => *format,
        }
    }
}

/// Buffering writer for one stream's batch file.
#[derive(Debug)]
pub struct BatchFileWriter {
    path: PathBuf,
    format: BatchFileFormat,
    rows: Vec<Record>,
    flushed: bool,
}

impl BatchFileWriter {
    /// Creates a writer for the given stream id under `dir`.
    ///
    /// The file itself is created at flush time.
    #[must_use]
    pub fn new(dir: &Path, stream_id: &str, format: BatchFileFormat) -> Self {
        let sanitized: String = stream_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let file_name = format!(
            "bulker_{sanitized}_{}.{}",
            crate::schema::random_suffix(8),
            format.extension()
        );
        Self {
            path: dir.join(file_name),
            format,
            rows: Vec::new(),
            flushed: false,
        }
    }

    /// Returns the staging file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the configured format.
    #[must_use]
    pub const fn format(&self) -> BatchFileFormat {
        self.format
    }

    /// Appends one row to the buffer.
    pub fn append(&mut self, record: Record) {
        self.rows.push(record);
    }

    /// Returns the number of buffered rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no rows are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes all buffered rows to disk and returns the load source.
    ///
    /// Values are coerced to the committed column types of `table` (the
    /// final, batch-wide coalesced schema), so a column that widened to
    /// `String` mid-batch is rendered as text for every row.
    ///
    /// # Errors
    ///
    /// Returns an io error if the file cannot be written.
    pub fn flush(&mut self, table: &Table) -> Result<LoadSource> {
        let file = fs::File::create(&self.path)
            .map_err(|e| Error::io(format!("create batch file {}", self.path.display()), e))?;
        let mut out = BufWriter::new(file);

        match self.format {
            BatchFileFormat::Ndjson => self.write_ndjson(&mut out, table)?,
            BatchFileFormat::Csv => self.write_csv(&mut out, table)?,
        }
        out.flush()
            .map_err(|e| Error::io(format!("flush batch file {}", self.path.display()), e))?;
        self.flushed = true;
        self.rows.clear();

        Ok(LoadSource::LocalFile {
            path: self.path.clone(),
            format: self.format,
        })
    }

    fn write_ndjson(&self, out: &mut impl Write, table: &Table) -> Result<()> {
        for row in &self.rows {
            let mut coerced = Record::new();
            for (name, value) in row {
                let target = table
                    .columns
                    .get(name)
                    .map_or(crate::types::DataType::Unknown, |c| c.data_type);
                coerced.insert(name.clone(), coerce(value, target));
            }
            let line = serde_json::to_string(&coerced).map_err(|e| Error::Serialization {
                message: format!("encode batch row: {e}"),
            })?;
            out.write_all(line.as_bytes())
                .and_then(|()| out.write_all(b"\n"))
                .map_err(|e| Error::io("write batch row", e))?;
        }
        Ok(())
    }

    fn write_csv(&self, out: &mut impl Write, table: &Table) -> Result<()> {
        let columns: Vec<&str> = table.column_names().collect();
        let header: Vec<String> = columns.iter().map(|c| csv_quote(c)).collect();
        out.write_all(header.join(",").as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .map_err(|e| Error::io("write csv header", e))?;

        for row in &self.rows {
            let mut fields = Vec::with_capacity(columns.len());
            for name in &columns {
                let target = table
                    .columns
                    .get(*name)
                    .map_or(crate::types::DataType::Unknown, |c| c.data_type);
                let rendered = row
                    .get(*name)
                    .map(|v| csv_render(&coerce(v, target)))
                    .unwrap_or_default();
                fields.push(rendered);
            }
            out.write_all(fields.join(",").as_bytes())
                .and_then(|()| out.write_all(b"\n"))
                .map_err(|e| Error::io("write csv row", e))?;
        }
        Ok(())
    }

    /// Unlinks the staging file, if it was ever written.
    pub fn release(&mut self) {
        if self.flushed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove batch file");
                }
            }
            self.flushed = false;
        }
        self.rows.clear();
    }
}

impl Drop for BatchFileWriter {
    fn drop(&mut self) {
        self.release();
    }
}

/// Quotes one CSV field, doubling embedded quotes.
fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Renders a value into a quoted CSV field; nulls render empty.
fn csv_render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => csv_quote(s),
        Value::Bool(_) | Value::Number(_) => csv_quote(&value.to_string()),
        other => csv_quote(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::types::DataType;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().expect("object").clone()
    }

    fn string_table(columns: &[&str]) -> Table {
        let mut t = Table::new("t");
        for c in columns {
            t.columns
                .insert((*c).to_owned(), Column::of(DataType::String));
        }
        t
    }

    #[test]
    fn ndjson_rows_have_sorted_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BatchFileWriter::new(dir.path(), "s1", BatchFileFormat::Ndjson);
        writer.append(record(json!({"b": 2, "a": 1})));

        let mut table = Table::new("t");
        table.columns.insert("a".into(), Column::of(DataType::Int64));
        table.columns.insert("b".into(), Column::of(DataType::Int64));
        let source = writer.flush(&table).expect("flush");

        let LoadSource::LocalFile { path, .. } = source else {
            panic!("expected local file");
        };
        let contents = fs::read_to_string(path).expect("read");
        assert_eq!(contents, "{\"a\":1,\"b\":2}\n");
    }

    #[test]
    fn csv_quotes_everything_and_doubles_quotes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BatchFileWriter::new(dir.path(), "s1", BatchFileFormat::Csv);
        writer.append(record(json!({"name": "say \"hi\"", "id": 1})));
        writer.append(record(json!({"id": 2})));

        let mut table = string_table(&["name"]);
        table.columns.insert("id".into(), Column::of(DataType::Int64));
        writer.flush(&table).expect("flush");

        let contents = fs::read_to_string(writer.path()).expect("read");
        assert_eq!(
            contents,
            "\"id\",\"name\"\n\"1\",\"say \"\"hi\"\"\"\n\"2\",\n"
        );
    }

    #[test]
    fn flush_coerces_to_committed_types() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BatchFileWriter::new(dir.path(), "s1", BatchFileFormat::Ndjson);
        writer.append(record(json!({"v": 7})));
        writer.append(record(json!({"v": "str"})));

        let table = string_table(&["v"]);
        writer.flush(&table).expect("flush");
        let contents = fs::read_to_string(writer.path()).expect("read");
        assert_eq!(contents, "{\"v\":\"7\"}\n{\"v\":\"str\"}\n");
    }

    #[test]
    fn release_unlinks_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BatchFileWriter::new(dir.path(), "s1", BatchFileFormat::Ndjson);
        writer.append(record(json!({"a": 1})));
        writer.flush(&string_table(&["a"])).expect("flush");
        assert!(writer.path().exists());

        writer.release();
        assert!(!writer.path().exists());
    }

    #[test]
    fn drop_unlinks_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path;
        {
            let mut writer = BatchFileWriter::new(dir.path(), "s1", BatchFileFormat::Ndjson);
            writer.append(record(json!({"a": 1})));
            writer.flush(&string_table(&["a"])).expect("flush");
            path = writer.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
