//! MySQL adapter.
//!
//! MySQL has no schemas distinct from databases, so the destination
//! database doubles as the namespace. Primary keys are anonymous
//! (`PRIMARY`), which means every discovered key is reported under a
//! bulker-managed name and may be reconfigured on drift, matching how the
//! diff treats managed constraints.
//!
//! `LOAD DATA LOCAL INFILE` requires client-side file streaming the sqlx
//! driver does not implement, so bulk loads always take the prepared NDJSON
//! insert fallback; the server-side `local_infile` switch is still probed
//! at connect time for the operator log.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column as _, MySql, MySqlPool, Row, TypeInfo};

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{managed_pk_name, Column, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, parse_timestamp, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::from_sqlx;
use crate::destination::DestinationConfig;
use crate::dialect::{deprecated_table_name, Dialect};

const LOAD_CHUNK_ROWS: usize = 100;

/// MySQL connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MySqlConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Connection pool size.
    #[serde(default)]
    pub pool_size: Option<u32>,
}

fn default_port() -> u16 {
    3306
}

/// MySQL destination adapter.
pub struct MySqlAdapter {
    pool: MySqlPool,
    dialect: Dialect,
    database: String,
}

impl MySqlAdapter {
    /// Connects a pool to the configured server.
    ///
    /// # Errors
    ///
    /// Returns a classified error when the server is unreachable or
    /// credentials are rejected.
    pub async fn connect(config: &DestinationConfig) -> Result<Self> {
        let params: MySqlConfig = config.parameters_as()?;
        let options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .database(&params.database)
            .username(&params.username)
            .password(&params.password)
            .ssl_mode(MySqlSslMode::Preferred);
        let pool = MySqlPoolOptions::new()
            .max_connections(params.pool_size.unwrap_or(10))
            .connect_with(options)
            .await
            .map_err(|e| from_sqlx(Backend::Mysql, "connect", e))?;

        let infile_enabled = sqlx::query("SHOW GLOBAL VARIABLES LIKE 'local_infile'")
            .fetch_optional(&pool)
            .await
            .ok()
            .flatten()
            .and_then(|row| row.try_get::<String, _>(1).ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("ON"));
        if infile_enabled {
            tracing::info!(
                "server allows LOCAL INFILE, but the driver streams no local files; \
                 bulk loads use prepared inserts"
            );
        }

        Ok(Self {
            pool,
            dialect: Dialect::mysql(),
            database: params.database,
        })
    }
}

#[async_trait]
impl SqlAdapter for MySqlAdapter {
    fn backend(&self) -> Backend {
        Backend::Mysql
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Ndjson
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| from_sqlx(Backend::Mysql, "ping", e))
    }

    async fn init_database(&self) -> Result<()> {
        // connecting already selects the database; nothing to create
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(MySqlSession {
            exec: Some(MySqlExec::Pool(self.pool.clone())),
            dialect: self.dialect.clone(),
            database: self.database.clone(),
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(Backend::Mysql, "begin", e))?;
        Ok(Box::new(MySqlSession {
            exec: Some(MySqlExec::Tx(tx)),
            dialect: self.dialect.clone(),
            database: self.database.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

enum MySqlExec {
    Pool(MySqlPool),
    Tx(sqlx::Transaction<'static, MySql>),
}

struct MySqlSession {
    exec: Option<MySqlExec>,
    dialect: Dialect,
    database: String,
}

impl MySqlSession {
    fn exec(&mut self) -> Result<&mut MySqlExec> {
        self.exec
            .as_mut()
            .ok_or_else(|| Error::backend(ErrorKind::Fatal, "session already finished"))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = match self.exec()? {
            MySqlExec::Pool(pool) => sqlx::query(sql).execute(&*pool).await,
            MySqlExec::Tx(tx) => sqlx::query(sql).execute(&mut **tx).await,
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| from_sqlx(Backend::Mysql, sql, e))
    }

    async fn execute_bound(
        &mut self,
        sql: &str,
        query: Query<'_, MySql, MySqlArguments>,
    ) -> Result<u64> {
        let result = match self.exec()? {
            MySqlExec::Pool(pool) => query.execute(&*pool).await,
            MySqlExec::Tx(tx) => query.execute(&mut **tx).await,
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| from_sqlx(Backend::Mysql, sql, e))
    }

    async fn fetch_all_bound(
        &mut self,
        sql: &str,
        query: Query<'_, MySql, MySqlArguments>,
    ) -> Result<Vec<MySqlRow>> {
        let result = match self.exec()? {
            MySqlExec::Pool(pool) => query.fetch_all(&*pool).await,
            MySqlExec::Tx(tx) => query.fetch_all(&mut **tx).await,
        };
        result.map_err(|e| from_sqlx(Backend::Mysql, sql, e))
    }

    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let sql = "SELECT COUNT(*) FROM information_schema.tables \
                   WHERE table_schema = ? AND table_name = ?";
        let query = sqlx::query(sql)
            .bind(self.database.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        let count: i64 = rows
            .first()
            .and_then(|r| r.try_get(0).ok())
            .unwrap_or_default();
        Ok(count > 0)
    }

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
                query = bind_value(query, value, data_type);
            }
        }
        self.execute_bound(&sql, query).await.map(|_| ())
    }
}

/// Binds a value by its committed column type; timestamps are bound as
/// `DateTime` because the server rejects RFC 3339 text in strict mode.
fn bind_value(
    query: Query<'_, MySql, MySqlArguments>,
    value: Value,
    data_type: DataType,
) -> Query<'_, MySql, MySqlArguments> {
    if data_type == DataType::Timestamp {
        if let Value::String(s) = &value {
            if let Some(ts) = parse_timestamp(s) {
                return query.bind(ts);
            }
        }
    }
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

fn reverse_type(column_type: &str) -> DataType {
    let lower = column_type.to_lowercase();
    match () {
        () if lower.starts_with("tinyint(1)") => DataType::Bool,
        () if lower.starts_with("bigint")
            || lower.starts_with("int")
            || lower.starts_with("smallint")
            || lower.starts_with("mediumint")
            || lower.starts_with("tinyint") =>
        {
            DataType::Int64
        }
        () if lower.starts_with("double") || lower.starts_with("float") || lower.starts_with("decimal") => {
            DataType::Float64
        }
        () if lower.starts_with("timestamp") || lower.starts_with("datetime") => {
            DataType::Timestamp
        }
        () if lower.starts_with("json") => DataType::Json,
        () => DataType::String,
    }
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let mut table = Table::new(table_name);

        let sql = "SELECT column_name, column_type FROM information_schema.columns \
                   WHERE table_schema = ? AND table_name = ?";
        let query = sqlx::query(sql)
            .bind(self.database.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| from_sqlx(Backend::Mysql, "scan column name", e))?;
            let sql_type: String = row
                .try_get(1)
                .map_err(|e| from_sqlx(Backend::Mysql, "scan column type", e))?;
            if sql_type.is_empty() {
                continue;
            }
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

        let sql = "SELECT column_name FROM information_schema.columns \
                   WHERE table_schema = ? AND table_name = ? AND column_key = 'PRI'";
        let query = sqlx::query(sql)
            .bind(self.database.clone())
            .bind(table_name.to_owned());
        let rows = self.fetch_all_bound(sql, query).await?;
        for row in rows {
            let column: String = row
                .try_get(0)
                .map_err(|e| from_sqlx(Backend::Mysql, "scan pk column", e))?;
            table.pk_fields.insert(column);
        }
        if !table.pk_fields.is_empty() {
            // mysql names every primary key "PRIMARY"; report a managed name
            // so diffs may reconfigure it
            table.pk_name = managed_pk_name();
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
            let sql = self.dialect.drop_pk_sql(&patch.name, &patch.pk_name);
            self.execute(&sql).await?;
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
        let LoadSource::LocalFile {
            path,
            format: BatchFileFormat::Ndjson,
        } = source
        else {
            return Err(Error::backend(
                ErrorKind::Load,
                "mysql loads local ndjson batch files only",
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
            "DELETE FROM {} WHERE {} = ?",
            self.dialect.quote_ident(table_name),
            self.dialect.quote_ident(PARTITION_ID_COLUMN)
        );
        let query = sqlx::query(&sql).bind(partition_id.to_owned());
        self.execute_bound(&sql, query).await
    }

    async fn widen_column_to_string(&mut self, table_name: &str, column: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} MODIFY {} TEXT",
            self.dialect.quote_ident(table_name),
            self.dialect.quote_ident(column)
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
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
        if let Some(MySqlExec::Tx(tx)) = self.exec.take() {
            tx.commit()
                .await
                .map_err(|e| from_sqlx(Backend::Mysql, "commit", e))?;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(MySqlExec::Tx(tx)) = self.exec.take() {
            tx.rollback()
                .await
                .map_err(|e| from_sqlx(Backend::Mysql, "rollback", e))?;
        }
        Ok(())
    }
}

fn row_to_record(row: &MySqlRow) -> Record {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_owned();
        let type_name = column.type_info().name().to_uppercase();
        let value = match type_name.as_str() {
            "BIGINT" | "INT" | "SMALLINT" | "MEDIUMINT" | "TINYINT" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::from),
            "DOUBLE" | "FLOAT" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
            "BOOLEAN" => row
                .try_get::<Option<bool>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::Bool),
            "TIMESTAMP" | "DATETIME" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
                .map_or(Value::Null, |ts| {
                    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
                }),
            "JSON" => row
                .try_get::<Option<Value>, _>(i)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
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
        assert_eq!(reverse_type("bigint(20)"), DataType::Int64);
        assert_eq!(reverse_type("tinyint(1)"), DataType::Bool);
        assert_eq!(reverse_type("double"), DataType::Float64);
        assert_eq!(reverse_type("timestamp(6)"), DataType::Timestamp);
        assert_eq!(reverse_type("text"), DataType::String);
        assert_eq!(reverse_type("json"), DataType::Json);
    }

    #[test]
    fn mysql_config_defaults() {
        let params: MySqlConfig = serde_json::from_value(serde_json::json!({
            "host": "localhost",
            "database": "events",
        }))
        .unwrap();
        assert_eq!(params.port, 3306);
    }
}
