//! Snowflake adapter over the SQL API v2.
//!
//! Statements run as independent REST calls authenticated with a bearer
//! token. Unquoted Snowflake identifiers fold to upper case, so the dialect
//! upper-cases every identifier before quoting and column lookups normalize
//! the same way. Values are rendered as literals; `VARIANT` columns go
//! through `PARSE_JSON`, timestamps through `TO_TIMESTAMP_TZ`, which is why
//! inserts are written as `INSERT … SELECT`.
//!
//! Sessions are emulated: each statement auto-commits, and rollback drops
//! whatever tables the session created, best effort.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{managed_pk_name, Column, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::{classify_http_status, classify_snowflake};
use crate::destination::DestinationConfig;
use crate::dialect::{deprecated_table_name, Dialect};
use crate::retry::{with_retries, RetryPolicy};

/// Rows per insert statement on the load path.
const LOAD_CHUNK_ROWS: usize = 50;

/// Snowflake connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowflakeConfig {
    /// Account locator, e.g. `xy12345.eu-central-1`.
    pub account: String,
    /// Database name.
    pub database: String,
    /// Virtual warehouse to run on.
    #[serde(default)]
    pub warehouse: Option<String>,
    /// OAuth or programmatic access token.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type", default)]
    sql_type: String,
}

struct Core {
    client: reqwest::Client,
    url: String,
    config: SnowflakeConfig,
    schema: String,
    dialect: Dialect,
    retry: RetryPolicy,
}

impl Core {
    async fn execute(&self, sql: &str) -> Result<StatementResponse> {
        let this = self;
        with_retries(self.retry, "snowflake statement", move || async move {
            this.execute_once(sql).await
        })
        .await
    }

    async fn execute_once(&self, sql: &str) -> Result<StatementResponse> {
        let mut body = json!({
            "statement": sql,
            "timeout": 120,
            "database": self.config.database,
            "schema": self.schema,
        });
        if let Some(warehouse) = &self.config.warehouse {
            body["warehouse"] = Value::String(warehouse.clone());
        }
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.config.token)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::backend_with_source(ErrorKind::Connection, "snowflake request", e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            Error::backend_with_source(ErrorKind::Connection, "snowflake response", e)
        })?;
        let parsed: StatementResponse =
            serde_json::from_str(&text).unwrap_or(StatementResponse {
                result_set_meta_data: None,
                data: Vec::new(),
                sql_state: None,
                message: None,
            });

        if !status.is_success() {
            let kind = parsed
                .sql_state
                .as_deref()
                .map_or_else(|| classify_http_status(status.as_u16()), classify_snowflake);
            return Err(Error::backend(
                kind,
                format!(
                    "snowflake statement failed ({status}): {}",
                    parsed.message.unwrap_or_else(|| "no message".into())
                ),
            ));
        }
        Ok(parsed)
    }

    /// Renders one value as a literal expression for the column type.
    fn literal(&self, value: &Value, data_type: DataType) -> String {
        let coerced = coerce(value, data_type);
        match data_type {
            DataType::Timestamp => match &coerced {
                Value::Null => "NULL".to_owned(),
                other => format!("TO_TIMESTAMP_TZ({})", self.dialect.render_literal(other)),
            },
            DataType::Json => match &coerced {
                Value::Null => "NULL".to_owned(),
                Value::String(s) => format!("PARSE_JSON({})", self.dialect.string_literal(s)),
                other => format!(
                    "PARSE_JSON({})",
                    self.dialect.string_literal(&other.to_string())
                ),
            },
            _ => self.dialect.render_literal(&coerced),
        }
    }

    /// `SELECT lit, lit, … UNION ALL SELECT …` rows for insert-select.
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
}

fn reverse_type(sf_type: &str) -> DataType {
    match sf_type.to_uppercase().as_str() {
        "FIXED" | "NUMBER" | "INT" | "INTEGER" | "BIGINT" => DataType::Int64,
        "REAL" | "FLOAT" | "DOUBLE" => DataType::Float64,
        "BOOLEAN" => DataType::Bool,
        "VARIANT" | "OBJECT" | "ARRAY" => DataType::Json,
        t if t.starts_with("TIMESTAMP") => DataType::Timestamp,
        _ => DataType::String,
    }
}

/// Snowflake destination adapter.
pub struct SnowflakeAdapter {
    core: Arc<Core>,
}

impl SnowflakeAdapter {
    /// Builds the SQL API client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when parameters are malformed.
    pub fn connect(config: &DestinationConfig) -> Result<Self> {
        let params: SnowflakeConfig = config.parameters_as()?;
        let dialect = Dialect::snowflake();
        let schema = dialect.fold(&config.schema.clone().unwrap_or_else(|| "public".into()));
        let url = format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            params.account
        );
        Ok(Self {
            core: Arc::new(Core {
                client: reqwest::Client::new(),
                url,
                config: params,
                schema,
                dialect,
                retry: RetryPolicy::default(),
            }),
        })
    }
}

#[async_trait]
impl SqlAdapter for SnowflakeAdapter {
    fn backend(&self) -> Backend {
        Backend::Snowflake
    }

    fn dialect(&self) -> &Dialect {
        &self.core.dialect
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Ndjson
    }

    async fn ping(&self) -> Result<()> {
        self.core.execute("SELECT 1").await.map(|_| ())
    }

    async fn init_database(&self) -> Result<()> {
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.core.dialect.quote_ident(&self.core.schema)
        );
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(SnowflakeSession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: false,
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(SnowflakeSession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: true,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct SnowflakeSession {
    core: Arc<Core>,
    created_tables: Vec<String>,
    transactional: bool,
}

impl SnowflakeSession {
    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.information_schema.tables \
             WHERE table_schema = '{}' AND table_name = '{}'",
            self.core.dialect.quote_ident(&self.core.config.database),
            self.core.schema.replace('\'', "''"),
            self.core.dialect.fold(table_name).replace('\'', "''"),
        );
        let response = self.core.execute(&sql).await?;
        Ok(response
            .data
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            > 0)
    }

    async fn insert_chunk(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<&str> = table.column_names().collect();
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| self.core.dialect.quote_ident(c))
            .collect();
        let source = self.core.select_rows(table, &columns, rows);
        let sql = if merge && !table.pk_fields.is_empty() {
            self.core
                .dialect
                .merge_into_sql(table, &format!("({source})"), &columns)
        } else {
            format!(
                "INSERT INTO {} ({}) {source}",
                self.core.dialect.quote_ident(&table.name),
                quoted.join(", ")
            )
        };
        self.core.execute(&sql).await.map(|_| ())
    }
}

#[async_trait]
impl SqlSession for SnowflakeSession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let mut table = Table::new(table_name);
        let sql = format!(
            "SELECT column_name, data_type FROM {}.information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}'",
            self.core.dialect.quote_ident(&self.core.config.database),
            self.core.schema.replace('\'', "''"),
            self.core.dialect.fold(table_name).replace('\'', "''"),
        );
        let response = self.core.execute(&sql).await?;
        for row in &response.data {
            let Some(Some(name)) = row.first().cloned() else {
                continue;
            };
            let sql_type = row
                .get(1)
                .cloned()
                .flatten()
                .unwrap_or_default();
            table.columns.insert(
                name,
                Column {
                    data_type: reverse_type(&sql_type),
                    sql_type,
                    ..Column::default()
                },
            );
        }
        if table.columns.is_empty() {
            return Ok(table);
        }

        let sql = format!(
            "SHOW PRIMARY KEYS IN TABLE {}",
            self.core.dialect.quote_ident(table_name)
        );
        if let Ok(response) = self.core.execute(&sql).await {
            let meta = response.result_set_meta_data.as_ref();
            let index_of = |field: &str| {
                meta.and_then(|m| {
                    m.row_type
                        .iter()
                        .position(|r| r.name.eq_ignore_ascii_case(field))
                })
            };
            let column_idx = index_of("column_name");
            let constraint_idx = index_of("constraint_name");
            for row in &response.data {
                if let Some(idx) = column_idx {
                    if let Some(Some(column)) = row.get(idx).cloned() {
                        table.pk_fields.insert(column);
                    }
                }
                if let Some(idx) = constraint_idx {
                    if let Some(Some(constraint)) = row.get(idx).cloned() {
                        table.pk_name = constraint;
                    }
                }
            }
        }
        if !table.pk_fields.is_empty() && table.pk_name.is_empty() {
            table.pk_name = managed_pk_name();
        }
        Ok(table)
    }

    async fn create_table(&mut self, table: &Table) -> Result<()> {
        let sql = self.core.dialect.create_table_sql(table);
        self.core.execute(&sql).await?;
        self.created_tables
            .push(self.core.dialect.fold(&table.name));
        Ok(())
    }

    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()> {
        for (name, column) in &patch.columns {
            let sql = self.core.dialect.add_column_sql(patch, name, column);
            self.core.execute(&sql).await?;
        }
        if patch.delete_pk_fields {
            let sql = format!(
                "ALTER TABLE {} DROP PRIMARY KEY",
                self.core.dialect.quote_ident(&patch.name)
            );
            self.core.execute(&sql).await?;
        }
        if !patch.pk_fields.is_empty() {
            let sql = self.core.dialect.add_pk_sql(patch);
            self.core.execute(&sql).await?;
        }
        Ok(())
    }

    async fn insert(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        self.insert_chunk(table, merge, rows).await
    }

    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let columns: Vec<&str> = source.column_names().collect();
        let statements = self
            .core
            .dialect
            .copy_sql(target, &source.name, &columns, merge);
        for sql in statements {
            self.core.execute(&sql).await?;
        }
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
                "snowflake loads local ndjson batch files only",
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
        if existed {
            // atomic swap, then move the old data aside under the
            // deprecated name
            let sql = format!(
                "ALTER TABLE {} SWAP WITH {}",
                self.core.dialect.quote_ident(&replacement.name),
                self.core.dialect.quote_ident(target_name),
            );
            self.core.execute(&sql).await?;
            let deprecated = deprecated_table_name(target_name);
            let sql = self
                .core
                .dialect
                .rename_sql(&replacement.name, &deprecated);
            self.core.execute(&sql).await?;
            if drop_old {
                self.drop_table(&deprecated, true)
                    .await
                    .map_err(|e| Error::backend(ErrorKind::Drop, e.to_string()))?;
            }
        } else {
            let sql = self
                .core
                .dialect
                .rename_sql(&replacement.name, target_name);
            self.core.execute(&sql).await?;
        }
        Ok(())
    }

    async fn truncate_table(&mut self, table_name: &str) -> Result<()> {
        let sql = self.core.dialect.truncate_sql(table_name);
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()> {
        let sql = self.core.dialect.drop_sql(table_name, if_exists);
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.core.dialect.quote_ident(table_name),
            self.core.dialect.quote_ident(PARTITION_ID_COLUMN),
            self.core.dialect.string_literal(partition_id),
        );
        self.core.execute(&sql).await.map(|_| 0)
    }

    async fn widen_column_to_string(&mut self, _table_name: &str, column: &str) -> Result<()> {
        Err(Error::backend(
            ErrorKind::Syntax,
            format!("snowflake cannot widen column {column} in place"),
        ))
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            self.core.dialect.quote_ident(table_name)
        );
        let response = self.core.execute(&sql).await?;
        Ok(response
            .data
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT * FROM {}",
            self.core.dialect.quote_ident(table_name)
        );
        let response = self.core.execute(&sql).await?;
        let row_type = response
            .result_set_meta_data
            .map(|m| m.row_type)
            .unwrap_or_default();
        let mut records = Vec::with_capacity(response.data.len());
        for row in response.data {
            let mut record = Record::new();
            for (i, meta) in row_type.iter().enumerate() {
                let raw = row.get(i).cloned().flatten();
                let value = match raw {
                    None => Value::Null,
                    Some(text) => match reverse_type(&meta.sql_type) {
                        DataType::Int64 => text
                            .parse::<i64>()
                            .map_or_else(|_| Value::String(text), Value::from),
                        DataType::Float64 => text
                            .parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                            .map_or_else(|| Value::String(text.clone()), Value::Number),
                        DataType::Bool => {
                            if text == "true" || text == "TRUE" {
                                Value::Bool(true)
                            } else if text == "false" || text == "FALSE" {
                                Value::Bool(false)
                            } else {
                                Value::String(text)
                            }
                        }
                        _ => Value::String(text),
                    },
                };
                record.insert(meta.name.clone(), value);
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
                    self.core.dialect.quote_ident(&table)
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

    #[test]
    fn reverse_type_mapping() {
        assert_eq!(reverse_type("FIXED"), DataType::Int64);
        assert_eq!(reverse_type("REAL"), DataType::Float64);
        assert_eq!(reverse_type("TIMESTAMP_TZ"), DataType::Timestamp);
        assert_eq!(reverse_type("VARIANT"), DataType::Json);
        assert_eq!(reverse_type("TEXT"), DataType::String);
    }

    #[test]
    fn literals_follow_column_types() {
        let core = Core {
            client: reqwest::Client::new(),
            url: String::new(),
            config: SnowflakeConfig {
                account: "xy".into(),
                database: "EVENTS".into(),
                warehouse: None,
                token: "t".into(),
            },
            schema: "PUBLIC".into(),
            dialect: Dialect::snowflake(),
            retry: RetryPolicy::default(),
        };
        assert_eq!(
            core.literal(&json!("2022-08-18T14:17:22Z"), DataType::Timestamp),
            "TO_TIMESTAMP_TZ('2022-08-18T14:17:22Z')"
        );
        assert_eq!(
            core.literal(&json!({"a": 1}), DataType::Json),
            "PARSE_JSON('{\"a\":1}')"
        );
        assert_eq!(core.literal(&json!(7), DataType::String), "'7'");
        assert_eq!(core.literal(&Value::Null, DataType::Int64), "NULL");
    }
}
