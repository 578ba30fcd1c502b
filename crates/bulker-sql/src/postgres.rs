//! PostgreSQL adapter.
//!
//! Statements run through an `sqlx` pool whose connections pin
//! `search_path` to the destination schema, so generated SQL stays
//! unqualified. Bulk loads use `COPY … FROM STDIN` with the CSV staging
//! format; transactional sessions wrap one pooled connection.
//!
//! The session type is shared with the Redshift adapter, which speaks the
//! postgres wire protocol but loads from S3 and merges via delete+insert.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column as _, Executor, PgPool, Postgres, Row, TypeInfo};

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{Column, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::from_sqlx;
use crate::destination::DestinationConfig;
use crate::dialect::{deprecated_table_name, Dialect};

/// Rows per multi-row insert statement on the fallback load path.
const LOAD_CHUNK_ROWS: usize = 100;

/// Connection parameters shared by the postgres-protocol backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Login role.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// `disable`, `prefer` (default), or `require`.
    #[serde(default)]
    pub ssl_mode: Option<String>,
    /// Connection pool size.
    #[serde(default)]
    pub pool_size: Option<u32>,
}

fn default_port() -> u16 {
    5432
}

/// PostgreSQL destination adapter.
pub struct PostgresAdapter {
    pool: PgPool,
    dialect: Dialect,
    schema: String,
}

impl PostgresAdapter {
    /// Connects a pool to the configured server.
    ///
    /// # Errors
    ///
    /// Returns a classified error when the server is unreachable or
    /// credentials are rejected.
    pub async fn connect(config: &DestinationConfig) -> Result<Self> {
        let params: PostgresConfig = config.parameters_as()?;
        let schema = config.schema.clone().unwrap_or_else(|| "public".into());
        let pool = build_pool(&params, &schema, Backend::Postgres).await?;
        Ok(Self {
            pool,
            dialect: Dialect::postgres(),
            schema,
        })
    }
}

/// Builds a pool whose connections pin `search_path` to the schema.
pub(crate) async fn build_pool(
    params: &PostgresConfig,
    schema: &str,
    backend: Backend,
) -> Result<PgPool> {
    let ssl_mode = match params.ssl_mode.as_deref() {
        Some("disable") => PgSslMode::Disable,
        Some("require") => PgSslMode::Require,
        _ => PgSslMode::Prefer,
    };
    let options = PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .database(&params.database)
        .username(&params.username)
        .password(&params.password)
        .ssl_mode(ssl_mode);

    let set_search_path = format!("SET search_path TO {}", quote_pg(schema));
    PgPoolOptions::new()
        .max_connections(params.pool_size.unwrap_or(10))
        .after_connect(move |conn, _meta| {
            let set_search_path = set_search_path.clone();
            Box::pin(async move {
                conn.execute(set_search_path.as_str()).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
        .map_err(|e| from_sqlx(backend, "connect", e))
}

fn quote_pg(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[async_trait]
impl SqlAdapter for PostgresAdapter {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Csv
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| from_sqlx(Backend::Postgres, "ping", e))
    }

    async fn init_database(&self) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_pg(&self.schema));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| from_sqlx(Backend::Postgres, "init schema", e))
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(PgSession {
            exec: Some(PgExec::Pool(self.pool.clone())),
            dialect: self.dialect.clone(),
            backend: Backend::Postgres,
            schema: self.schema.clone(),
            s3_copy: None,
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(Backend::Postgres, "begin", e))?;
        Ok(Box::new(PgSession {
            exec: Some(PgExec::Tx(tx)),
            dialect: self.dialect.clone(),
            backend: Backend::Postgres,
            schema: self.schema.clone(),
            s3_copy: None,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// S3 staging credentials for the Redshift `COPY` load path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct S3CopyConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub(crate) enum PgExec {
    Pool(PgPool),
    Tx(sqlx::Transaction<'static, Postgres>),
}

/// One session over the postgres wire protocol.
pub(crate) struct PgSession {
    pub exec: Option<PgExec>,
    pub dialect: Dialect,
    pub backend: Backend,
    pub schema: String,
    pub s3_copy: Option<S3CopyConfig>,
}

impl PgSession {
    fn exec(&mut self) -> Result<&mut PgExec> {
        self.exec
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "session already finished"))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let backend = self.backend;
        let result = match self.exec()? {
            PgExec::Pool(pool) => sqlx::query(sql).execute(&*pool).await,
            PgExec::Tx(tx) => sqlx::query(sql).execute(&mut **tx).await,
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| from_sqlx(backend, sql, e))
    }

    async fn execute_bound(&mut self, sql: &str, query: Query<'_, Postgres, PgArguments>) -> Result<u64> {
        let backend = self.backend;
        let result = match self.exec()? {
            PgExec::Pool(pool) => query.execute(&*pool).await,
            PgExec::Tx(tx) => query.execute(&mut **tx).await,
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| from_sqlx(backend, sql, e))
    }

    async fn fetch_all_bound(
        &mut self,
        sql: &str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<PgRow>> {
        let backend = self.backend;
        let result = match self.exec()? {
            PgExec::Pool(pool) => query.fetch_all(&*pool).await,
            PgExec::Tx(tx) => query.fetch_all(&mut **tx).await,
        };
        result.map_err(|e| from_sqlx(backend, sql, e))
    }

    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let sql = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                   WHERE table_schema = $1 AND table_name = $2)";
        let query = sqlx::query(sql)
            .bind(self.schema.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        Ok(rows
            .first()
            .and_then(|r| r.try_get::<bool, _>(0).ok())
            .unwrap_or(false))
    }

    async fn current_pk_name(&mut self, table_name: &str) -> Result<Option<String>> {
        let sql = "SELECT tc.constraint_name FROM information_schema.table_constraints tc \
                   WHERE tc.table_schema = $1 AND tc.table_name = $2 \
                   AND tc.constraint_type = 'PRIMARY KEY'";
        let query = sqlx::query(sql)
            .bind(self.schema.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        Ok(rows.first().and_then(|r| r.try_get::<String, _>(0).ok()))
    }

    /// Prepared multi-row insert used for NDJSON loads and the generic
    /// insert path.
    async fn insert_chunk(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<&str> = table.column_names().collect();
        let sql = self.dialect.insert_sql(table, &columns, rows.len(), merge);
        let mut query = sqlx::query(&sql);
        for row in rows {
            for name in &columns {
                let data_type = table
                    .columns
                    .get(*name)
                    .map_or(DataType::Unknown, |c| c.data_type);
                let value = row.get(*name).map_or(Value::Null, |v| coerce(v, data_type));
                query = bind_value(query, value);
            }
        }
        self.execute_bound(&sql, query).await.map(|_| ())
    }
}

/// Binds one JSON value as its natural wire type; placeholder casts in the
/// statement coerce the rest server-side.
fn bind_value(
    query: Query<'_, Postgres, PgArguments>,
    value: Value,
) -> Query<'_, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        Value::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

/// Maps an information-schema type back to the canonical type.
pub(crate) fn reverse_type(sql_type: &str) -> DataType {
    let lower = sql_type.to_lowercase();
    match lower.as_str() {
        "bigint" | "integer" | "smallint" | "int8" | "int4" | "int2" => DataType::Int64,
        "double precision" | "real" | "numeric" | "float8" | "float4" => DataType::Float64,
        "boolean" | "bool" => DataType::Bool,
        "json" | "jsonb" => DataType::Json,
        _ if lower.starts_with("timestamp") => DataType::Timestamp,
        _ => DataType::String,
    }
}

#[async_trait]
impl SqlSession for PgSession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let mut table = Table::new(table_name);

        let sql = "SELECT column_name, data_type FROM information_schema.columns \
                   WHERE table_schema = $1 AND table_name = $2";
        let query = sqlx::query(sql)
            .bind(self.schema.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| from_sqlx(self.backend, "scan column name", e))?;
            let sql_type: String = row
                .try_get(1)
                .map_err(|e| from_sqlx(self.backend, "scan column type", e))?;
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

        let sql = "SELECT kcu.column_name, tc.constraint_name \
                   FROM information_schema.table_constraints tc \
                   JOIN information_schema.key_column_usage kcu \
                     ON tc.constraint_name = kcu.constraint_name \
                    AND tc.table_schema = kcu.table_schema \
                    AND tc.table_name = kcu.table_name \
                   WHERE tc.table_schema = $1 AND tc.table_name = $2 \
                     AND tc.constraint_type = 'PRIMARY KEY'";
        let query = sqlx::query(sql)
            .bind(self.schema.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        for row in rows {
            let column: String = row
                .try_get(0)
                .map_err(|e| from_sqlx(self.backend, "scan pk column", e))?;
            let constraint: String = row
                .try_get(1)
                .map_err(|e| from_sqlx(self.backend, "scan pk name", e))?;
            table.pk_fields.insert(column);
            table.pk_name = constraint;
        }
        Ok(table)
    }

    async fn create_table(&mut self, table: &Table) -> Result<()> {
        let sql = self.dialect.create_table_sql(table);
        self.execute(&sql).await.map(|_| ())
    }

    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()> {
        for (name, column) in &patch.columns {
            let sql = self.dialect.add_column_sql(patch, name, column);
            self.execute(&sql).await?;
        }
        if patch.delete_pk_fields {
            if let Some(pk_name) = self.current_pk_name(&patch.name).await? {
                let sql = self.dialect.drop_pk_sql(&patch.name, &pk_name);
                self.execute(&sql).await?;
            }
        }
        if !patch.pk_fields.is_empty() {
            let sql = self.dialect.add_pk_sql(patch);
            self.execute(&sql).await?;
        }
        Ok(())
    }

    async fn insert(&mut self, table: &Table, merge: bool, rows: &[Record]) -> Result<()> {
        self.insert_chunk(table, merge, rows).await
    }

    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let columns: Vec<&str> = source.column_names().collect();
        let statements = self
            .dialect
            .copy_sql(target, &source.name, &columns, merge);
        let mut affected = 0;
        for sql in statements {
            affected = self.execute(&sql).await?;
        }
        Ok(affected)
    }

    async fn load_table(&mut self, target: &Table, source: &LoadSource) -> Result<u64> {
        match source {
            LoadSource::LocalFile {
                path,
                format: BatchFileFormat::Csv,
            } if self.backend == Backend::Postgres => {
                let columns: Vec<String> = target
                    .column_names()
                    .map(|c| self.dialect.quote_ident(c))
                    .collect();
                let statement = format!(
                    "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
                    self.dialect.quote_ident(&target.name),
                    columns.join(", ")
                );
                let data = std::fs::read(path)
                    .map_err(|e| Error::io(format!("read batch file {}", path.display()), e))?;
                let backend = self.backend;
                let loaded = match self.exec()? {
                    PgExec::Pool(pool) => {
                        let mut conn = pool
                            .acquire()
                            .await
                            .map_err(|e| from_sqlx(backend, "acquire", e))?;
                        let mut copy = conn
                            .copy_in_raw(&statement)
                            .await
                            .map_err(|e| from_sqlx(backend, &statement, e))?;
                        copy.send(data)
                            .await
                            .map_err(|e| from_sqlx(backend, "copy send", e))?;
                        copy.finish()
                            .await
                            .map_err(|e| from_sqlx(backend, "copy finish", e))?
                    }
                    PgExec::Tx(tx) => {
                        let conn = &mut **tx;
                        let mut copy = conn
                            .copy_in_raw(&statement)
                            .await
                            .map_err(|e| from_sqlx(backend, &statement, e))?;
                        copy.send(data)
                            .await
                            .map_err(|e| from_sqlx(backend, "copy send", e))?;
                        copy.finish()
                            .await
                            .map_err(|e| from_sqlx(backend, "copy finish", e))?
                    }
                };
                Ok(loaded)
            }
            LoadSource::LocalFile {
                path,
                format: BatchFileFormat::Ndjson,
            } => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| Error::io(format!("read batch file {}", path.display()), e))?;
                let mut rows = Vec::new();
                let mut loaded = 0u64;
                for line in contents.lines().filter(|l| !l.is_empty()) {
                    let row: Record =
                        serde_json::from_str(line).map_err(|e| Error::Serialization {
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
            LoadSource::S3 {
                bucket,
                key,
                region,
                format,
            } if self.backend == Backend::Redshift => {
                let Some(s3) = self.s3_copy.clone() else {
                    return Err(Error::backend(
                        ErrorKind::Load,
                        "s3 load source requires s3 credentials in the destination config",
                    ));
                };
                let format_clause = match format {
                    BatchFileFormat::Csv => "FORMAT AS CSV IGNOREHEADER 1",
                    BatchFileFormat::Ndjson => "FORMAT AS JSON 'auto'",
                };
                let region = if region.is_empty() { &s3.region } else { region };
                let statement = format!(
                    "COPY {} FROM 's3://{bucket}/{key}' \
                     CREDENTIALS 'aws_access_key_id={};aws_secret_access_key={}' \
                     REGION '{region}' {format_clause}",
                    self.dialect.quote_ident(&target.name),
                    s3.access_key_id,
                    s3.secret_access_key,
                );
                self.execute(&statement).await
            }
            _ => Err(Error::backend(
                ErrorKind::Load,
                format!("unsupported load source for {}", self.backend),
            )),
        }
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
            let sql = self.dialect.rename_sql(target_name, &deprecated);
            self.execute(&sql).await?;
        }
        let sql = self.dialect.rename_sql(&replacement.name, target_name);
        self.execute(&sql).await?;
        if drop_old && existed {
            self.drop_table(&deprecated, true)
                .await
                .map_err(|e| Error::backend(ErrorKind::Drop, e.to_string()))?;
        }
        Ok(())
    }

    async fn truncate_table(&mut self, table_name: &str) -> Result<()> {
        let sql = self.dialect.truncate_sql(table_name);
        self.execute(&sql).await.map(|_| ())
    }

    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()> {
        let sql = self.dialect.drop_sql(table_name, if_exists);
        self.execute(&sql).await.map(|_| ())
    }

    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            self.dialect.quote_ident(table_name),
            self.dialect.quote_ident(PARTITION_ID_COLUMN)
        );
        let query = sqlx::query(&sql).bind(partition_id.to_owned());
        self.execute_bound(&sql, query).await
    }

    async fn widen_column_to_string(&mut self, table_name: &str, column: &str) -> Result<()> {
        let quoted = self.dialect.quote_ident(column);
        let sql = format!(
            "ALTER TABLE {} ALTER COLUMN {quoted} TYPE text USING {quoted}::text",
            self.dialect.quote_ident(table_name),
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {}",
            self.dialect.quote_ident(table_name)
        );
        let query = sqlx::query(&sql);
        let rows = self.fetch_all_bound(&sql, query).await?;
        let count: i64 = rows
            .first()
            .and_then(|r| r.try_get(0).ok())
            .unwrap_or_default();
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>> {
        let sql = format!("SELECT * FROM {}", self.dialect.quote_ident(table_name));
        let query = sqlx::query(&sql);
        let rows = self.fetch_all_bound(&sql, query).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(PgExec::Tx(tx)) = self.exec.take() {
            tx.commit()
                .await
                .map_err(|e| from_sqlx(self.backend, "commit", e))?;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(PgExec::Tx(tx)) = self.exec.take() {
            tx.rollback()
                .await
                .map_err(|e| from_sqlx(self.backend, "rollback", e))?;
        }
        Ok(())
    }
}

/// Decodes one row into a record by column type name; values that fail to
/// decode become nulls rather than errors; this is a verification surface.
fn row_to_record(row: &PgRow) -> Record {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_owned();
        let type_name = column.type_info().name().to_uppercase();
        let value = match type_name.as_str() {
            "INT8" | "INT4" | "INT2" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::from),
            "FLOAT8" | "FLOAT4" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::Bool),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(i)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" | "TIMESTAMP" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, |ts| {
                    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
                }),
            _ => row
                .try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::String),
        };
        record.insert(name, value);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_type_mapping() {
        assert_eq!(reverse_type("bigint"), DataType::Int64);
        assert_eq!(reverse_type("double precision"), DataType::Float64);
        assert_eq!(reverse_type("timestamp with time zone"), DataType::Timestamp);
        assert_eq!(reverse_type("jsonb"), DataType::Json);
        assert_eq!(reverse_type("text"), DataType::String);
        assert_eq!(reverse_type("character varying(65535)"), DataType::String);
    }

    #[test]
    fn postgres_config_defaults() {
        let params: PostgresConfig = serde_json::from_value(serde_json::json!({
            "host": "localhost",
            "database": "events",
        }))
        .unwrap();
        assert_eq!(params.port, 5432);
        assert!(params.username.is_empty());
    }
}
