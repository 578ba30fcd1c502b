//! BigQuery adapter over the jobs REST API.
//!
//! Every operation is a query job: DDL, DML, and the replace path, which
//! runs as query-job table copies (`CLONE`) because BigQuery has no
//! transactional DDL. Auto-commit streams are unsupported and fail fast at
//! stream creation. Sessions opened as transactions are emulated: work
//! applies immediately and rollback drops the tables the session created.
//!
//! Authentication uses a pre-issued OAuth bearer token from the
//! destination config; token refresh belongs to the credential supplier.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{Column, Granularity, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::{classify_bigquery, classify_http_status};
use crate::destination::DestinationConfig;
use crate::dialect::{deprecated_table_name, Dialect};
use crate::retry::{with_retries, RetryPolicy};

/// Rows per insert statement on the load path.
const LOAD_CHUNK_ROWS: usize = 50;

/// BigQuery connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigQueryConfig {
    /// GCP project id.
    pub project: String,
    /// Target dataset.
    pub dataset: String,
    /// Pre-issued OAuth bearer token.
    pub access_token: String,
    /// Dataset location for job routing.
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<RowWrapper>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldSchema {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct RowWrapper {
    #[serde(default)]
    f: Vec<CellWrapper>,
}

#[derive(Debug, Deserialize)]
struct CellWrapper {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

struct Core {
    client: reqwest::Client,
    url: String,
    config: BigQueryConfig,
    dialect: Dialect,
    retry: RetryPolicy,
}

impl Core {
    /// Fully qualified, backtick-quoted table reference.
    fn table_ref(&self, table_name: &str) -> String {
        format!(
            "`{}.{}.{}`",
            self.config.project, self.config.dataset, table_name
        )
    }

    fn dataset_ref(&self) -> String {
        format!("`{}.{}`", self.config.project, self.config.dataset)
    }

    async fn execute(&self, sql: &str) -> Result<QueryResponse> {
        let this = self;
        with_retries(self.retry, "bigquery query", move || async move {
            this.execute_once(sql).await
        })
        .await
    }

    async fn execute_once(&self, sql: &str) -> Result<QueryResponse> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": 120_000,
        });
        if let Some(location) = &self.config.location {
            body["location"] = Value::String(location.clone());
        }
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::backend_with_source(ErrorKind::Connection, "bigquery request", e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            Error::backend_with_source(ErrorKind::Connection, "bigquery response", e)
        })?;
        if !status.is_success() {
            let parsed: ErrorResponse = serde_json::from_str(&text).unwrap_or(ErrorResponse {
                error: None,
            });
            let (kind, message) = parsed.error.map_or_else(
                || (classify_http_status(status.as_u16()), text.clone()),
                |body| {
                    let kind = body
                        .errors
                        .first()
                        .map_or_else(|| classify_http_status(status.as_u16()), |d| {
                            classify_bigquery(&d.reason)
                        });
                    (kind, body.message)
                },
            );
            return Err(Error::backend(
                kind,
                format!("bigquery job failed ({status}): {message}"),
            ));
        }
        serde_json::from_str(&text).map_err(|e| Error::Serialization {
            message: format!("parse bigquery response: {e}"),
        })
    }

    /// Renders one value as a GoogleSQL literal for the column type.
    fn literal(&self, value: &Value, data_type: DataType) -> String {
        let coerced = coerce(value, data_type);
        match data_type {
            DataType::Timestamp => match &coerced {
                Value::Null => "NULL".to_owned(),
                other => format!("TIMESTAMP {}", self.dialect.render_literal(other)),
            },
            DataType::Json => match &coerced {
                Value::Null => "NULL".to_owned(),
                Value::String(s) => format!("JSON {}", self.dialect.string_literal(s)),
                other => format!(
                    "JSON {}",
                    self.dialect.string_literal(&other.to_string())
                ),
            },
            _ => self.dialect.render_literal(&coerced),
        }
    }

    fn select_rows(&self, table: &Table, columns: &[&str], rows: &[Record]) -> String {
        let mut selects = Vec::with_capacity(rows.len());
        for row in rows {
            let rendered: Vec<String> = columns
                .iter()
                .map(|name| {
                    let data_type = table
                        .columns
                        .get(*name)
                        .map_or(DataType::Unknown, |c| c.data_type);
                    let value = row.get(*name).cloned().unwrap_or(Value::Null);
                    format!(
                        "{} AS {}",
                        self.literal(&value, data_type),
                        self.dialect.quote_ident(name)
                    )
                })
                .collect();
            selects.push(format!("SELECT {}", rendered.join(", ")));
        }
        selects.join(" UNION ALL ")
    }

    fn merge_sql(&self, target: &Table, source: &str, columns: &[&str]) -> String {
        let on: Vec<String> = target
            .pk_fields
            .iter()
            .map(|f| {
                let q = self.dialect.quote_ident(f);
                format!("T.{q} = S.{q}")
            })
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !target.pk_fields.contains(**c))
            .map(|c| {
                let q = self.dialect.quote_ident(c);
                format!("T.{q} = S.{q}")
            })
            .collect();
        let quoted: Vec<String> = columns.iter().map(|c| self.dialect.quote_ident(c)).collect();
        let values: Vec<String> = quoted.iter().map(|q| format!("S.{q}")).collect();
        let matched = if updates.is_empty() {
            String::new()
        } else {
            format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", "))
        };
        format!(
            "MERGE INTO {} T USING {source} S ON {}{matched} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            self.table_ref(&target.name),
            on.join(" AND "),
            quoted.join(", "),
            values.join(", ")
        )
    }
}

fn reverse_type(bq_type: &str) -> DataType {
    match bq_type.to_uppercase().as_str() {
        "INTEGER" | "INT64" => DataType::Int64,
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => DataType::Float64,
        "BOOLEAN" | "BOOL" => DataType::Bool,
        "TIMESTAMP" | "DATETIME" => DataType::Timestamp,
        "JSON" => DataType::Json,
        _ => DataType::String,
    }
}

/// BigQuery destination adapter.
pub struct BigQueryAdapter {
    core: Arc<Core>,
}

impl BigQueryAdapter {
    /// Builds the REST client for the configured project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when parameters are malformed.
    pub fn connect(config: &DestinationConfig) -> Result<Self> {
        let mut params: BigQueryConfig = config.parameters_as()?;
        if let Some(schema) = &config.schema {
            params.dataset.clone_from(schema);
        }
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            params.project
        );
        Ok(Self {
            core: Arc::new(Core {
                client: reqwest::Client::new(),
                url,
                config: params,
                dialect: Dialect::bigquery(),
                retry: RetryPolicy::default(),
            }),
        })
    }
}

#[async_trait]
impl SqlAdapter for BigQueryAdapter {
    fn backend(&self) -> Backend {
        Backend::Bigquery
    }

    fn dialect(&self) -> &Dialect {
        &self.core.dialect
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Ndjson
    }

    fn supports_autocommit(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<()> {
        self.core.execute("SELECT 1").await.map(|_| ())
    }

    async fn init_database(&self) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", self.core.dataset_ref());
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(BigQuerySession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: false,
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(BigQuerySession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: true,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct BigQuerySession {
    core: Arc<Core>,
    created_tables: Vec<String>,
    transactional: bool,
}

impl BigQuerySession {
    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.INFORMATION_SCHEMA.TABLES WHERE table_name = '{}'",
            self.core.dataset_ref(),
            table_name.replace('\'', "''"),
        );
        let response = self.core.execute(&sql).await?;
        Ok(first_cell_i64(&response) > 0)
    }

    async fn insert_chunk(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<&str> = table.column_names().collect();
        let source = self.core.select_rows(table, &columns, rows);
        let sql = if merge && !table.pk_fields.is_empty() {
            self.core.merge_sql(table, &format!("({source})"), &columns)
        } else {
            let quoted: Vec<String> = columns
                .iter()
                .map(|c| self.core.dialect.quote_ident(c))
                .collect();
            format!(
                "INSERT INTO {} ({}) {source}",
                self.core.table_ref(&table.name),
                quoted.join(", ")
            )
        };
        self.core.execute(&sql).await.map(|_| ())
    }
}

fn first_cell_i64(response: &QueryResponse) -> i64 {
    response
        .rows
        .first()
        .and_then(|row| row.f.first())
        .and_then(|cell| cell.v.as_str())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl SqlSession for BigQuerySession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let mut table = Table::new(table_name);
        let sql = format!(
            "SELECT column_name, data_type FROM {}.INFORMATION_SCHEMA.COLUMNS \
             WHERE table_name = '{}'",
            self.core.dataset_ref(),
            table_name.replace('\'', "''"),
        );
        let response = self.core.execute(&sql).await?;
        for row in &response.rows {
            let name = row.f.first().and_then(|c| c.v.as_str()).unwrap_or_default();
            let sql_type = row.f.get(1).and_then(|c| c.v.as_str()).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            table.columns.insert(
                name.to_owned(),
                Column {
                    data_type: reverse_type(sql_type),
                    sql_type: sql_type.to_owned(),
                    ..Column::default()
                },
            );
        }
        // bigquery primary keys are unenforced metadata; merges use the
        // stream's configured keys instead
        Ok(table)
    }

    async fn create_table(&mut self, table: &Table) -> Result<()> {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|(name, column)| {
                let ddl_type = if column.ddl_type().is_empty() {
                    self.core.dialect.sql_type(column.data_type)
                } else {
                    column.ddl_type()
                };
                format!("{} {ddl_type}", self.core.dialect.quote_ident(name))
            })
            .collect();
        let partition_clause = table.partition.as_ref().map_or_else(String::new, |p| {
            let granularity = match p.granularity {
                Granularity::Hour => "HOUR",
                Granularity::Day => "DAY",
                Granularity::Month => "MONTH",
                Granularity::Year => "YEAR",
            };
            format!(
                " PARTITION BY TIMESTAMP_TRUNC({}, {granularity})",
                self.core.dialect.quote_ident(&p.field)
            )
        });
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}){partition_clause}",
            self.core.table_ref(&table.name),
            columns.join(", ")
        );
        self.core.execute(&sql).await?;
        self.created_tables.push(table.name.clone());
        Ok(())
    }

    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()> {
        for (name, column) in &patch.columns {
            let ddl_type = if column.ddl_type().is_empty() {
                self.core.dialect.sql_type(column.data_type)
            } else {
                column.ddl_type()
            };
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {ddl_type}",
                self.core.table_ref(&patch.name),
                self.core.dialect.quote_ident(name)
            );
            self.core.execute(&sql).await?;
        }
        Ok(())
    }

    async fn insert(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        self.insert_chunk(table, merge, rows).await
    }

    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let columns: Vec<&str> = source.column_names().collect();
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| self.core.dialect.quote_ident(c))
            .collect();
        let sql = if merge && !target.pk_fields.is_empty() {
            let source_query = format!(
                "(SELECT {} FROM {})",
                quoted.join(", "),
                self.core.table_ref(&source.name)
            );
            self.core.merge_sql(target, &source_query, &columns)
        } else {
            format!(
                "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
                self.core.table_ref(&target.name),
                self.core.table_ref(&source.name),
                cols = quoted.join(", ")
            )
        };
        self.core.execute(&sql).await?;
        self.count(&target.name).await
    }

    async fn load_table(&mut self, target: &Table, source: &LoadSource) -> Result<u64> {
        let LoadSource::LocalFile {
            path,
            format: BatchFileFormat::Ndjson,
        } = source
        else {
            return Err(Error::backend(
                ErrorKind::Load,
                "bigquery loads local ndjson batch files only",
            ));
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read batch file {}", path.display()), e))?;
        let mut rows = Vec::new();
        let mut loaded = 0u64;
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let row: Record = serde_json::from_str(line).map_err(|e| Error::Serialization {
                message: format!("parse staged row: {e}"),
            })?;
            rows.push(row);
            if rows.len() >= LOAD_CHUNK_ROWS {
                self.insert_chunk(target, false, &rows).await?;
                loaded += rows.len() as u64;
                rows.clear();
            }
        }
        self.insert_chunk(target, false, &rows).await?;
        loaded += rows.len() as u64;
        Ok(loaded)
    }

    async fn replace_table(
        &mut self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        let existed = self.table_exists(target_name).await?;
        // a previous attempt whose drop step failed already completed the swap
        if existed && !self.table_exists(&replacement.name).await? {
            return Ok(());
        }
        let deprecated = deprecated_table_name(target_name);
        if existed {
            // query-job copies in place of transactional renames
            let sql = format!(
                "CREATE TABLE {} CLONE {}",
                self.core.table_ref(&deprecated),
                self.core.table_ref(target_name)
            );
            self.core.execute(&sql).await?;
        }
        let sql = format!(
            "CREATE OR REPLACE TABLE {} CLONE {}",
            self.core.table_ref(target_name),
            self.core.table_ref(&replacement.name)
        );
        self.core.execute(&sql).await?;
        self.drop_table(&replacement.name, true).await?;
        if drop_old && existed {
            self.drop_table(&deprecated, true)
                .await
                .map_err(|e| Error::backend(ErrorKind::Drop, e.to_string()))?;
        }
        Ok(())
    }

    async fn truncate_table(&mut self, table_name: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {}", self.core.table_ref(table_name));
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()> {
        let clause = if if_exists { "IF EXISTS " } else { "" };
        let sql = format!(
            "DROP TABLE {clause}{}",
            self.core.table_ref(table_name)
        );
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.core.table_ref(table_name),
            self.core.dialect.quote_ident(PARTITION_ID_COLUMN),
            self.core.dialect.string_literal(partition_id),
        );
        self.core.execute(&sql).await.map(|_| 0)
    }

    async fn widen_column_to_string(&mut self, _table_name: &str, column: &str) -> Result<()> {
        Err(Error::backend(
            ErrorKind::Syntax,
            format!("bigquery cannot widen column {column} in place"),
        ))
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.core.table_ref(table_name));
        let response = self.core.execute(&sql).await?;
        Ok(u64::try_from(first_cell_i64(&response)).unwrap_or_default())
    }

    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>> {
        let sql = format!("SELECT * FROM {}", self.core.table_ref(table_name));
        let response = self.core.execute(&sql).await?;
        let fields = response
            .schema
            .as_ref()
            .map(|s| s.fields.as_slice())
            .unwrap_or_default();
        let mut records = Vec::with_capacity(response.rows.len());
        for row in &response.rows {
            let mut record = Record::new();
            for (i, field) in fields.iter().enumerate() {
                let raw = row.f.get(i).map(|c| c.v.clone()).unwrap_or(Value::Null);
                let value = match (&raw, reverse_type(&field.field_type)) {
                    (Value::Null, _) => Value::Null,
                    (Value::String(s), DataType::Int64) => s
                        .parse::<i64>()
                        .map_or_else(|_| raw.clone(), Value::from),
                    (Value::String(s), DataType::Float64) => s
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map_or_else(|| raw.clone(), Value::Number),
                    (Value::String(s), DataType::Bool) => match s.as_str() {
                        "true" => Value::Bool(true),
                        "false" => Value::Bool(false),
                        _ => raw.clone(),
                    },
                    _ => raw.clone(),
                };
                record.insert(field.name.clone(), value);
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if self.transactional {
            let created = std::mem::take(&mut self.created_tables);
            for table in created.into_iter().rev() {
                let sql = format!(
                    "DROP TABLE IF EXISTS {}",
                    self.core.table_ref(&table)
                );
                if let Err(err) = self.core.execute(&sql).await {
                    tracing::warn!(table = %table, error = %err, "rollback cleanup failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Core {
        Core {
            client: reqwest::Client::new(),
            url: String::new(),
            config: BigQueryConfig {
                project: "acme".into(),
                dataset: "events".into(),
                access_token: "t".into(),
                location: None,
            },
            dialect: Dialect::bigquery(),
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn table_refs_are_fully_qualified() {
        assert_eq!(core().table_ref("pages"), "`acme.events.pages`");
        assert_eq!(core().dataset_ref(), "`acme.events`");
    }

    #[test]
    fn reverse_type_mapping() {
        assert_eq!(reverse_type("INTEGER"), DataType::Int64);
        assert_eq!(reverse_type("FLOAT"), DataType::Float64);
        assert_eq!(reverse_type("TIMESTAMP"), DataType::Timestamp);
        assert_eq!(reverse_type("JSON"), DataType::Json);
        assert_eq!(reverse_type("STRING"), DataType::String);
    }

    #[test]
    fn literals_follow_column_types() {
        let core = core();
        assert_eq!(
            core.literal(&serde_json::json!("2022-08-18T14:17:22Z"), DataType::Timestamp),
            "TIMESTAMP '2022-08-18T14:17:22Z'"
        );
        assert_eq!(
            core.literal(&serde_json::json!({"a": 1}), DataType::Json),
            "JSON '{\"a\":1}'"
        );
        assert_eq!(core.literal(&serde_json::json!(7), DataType::Int64), "7");
    }
}
