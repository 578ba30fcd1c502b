//! ClickHouse adapter over the HTTP interface.
//!
//! Statements are POSTed as text; inserts and loads stream `JSONEachRow` /
//! `CSVWithNames` bodies. There are no transactions: sessions opened as
//! transactions track the tables they create and drop them on rollback,
//! best effort.
//!
//! Merge semantics are `ReplacingMergeTree`: rows with the same ORDER BY
//! key deduplicate in background merges, so a merge is best-effort and the
//! table is eventually consistent; a copy with merge requested finishes
//! with `OPTIMIZE … FINAL` to force the collapse.
//!
//! With a configured cluster, every DDL runs `ON CLUSTER` and each logical
//! table is a pair: a replicated `<name>_shard` table plus a `Distributed`
//! wrapper carrying the logical name.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use bulker_core::batch_file::{BatchFileFormat, LoadSource};
use bulker_core::error::{Error, ErrorKind, Result};
use bulker_core::schema::{managed_pk_name, Column, Table, PARTITION_ID_COLUMN};
use bulker_core::types::{coerce, DataType, Record};

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::{classify_clickhouse, classify_http_status};
use crate::destination::DestinationConfig;
use crate::dialect::{deprecated_table_name, Dialect};
use crate::retry::{with_retries, RetryPolicy};

/// ClickHouse connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickHouseConfig {
    /// Server host.
    pub host: String,
    /// HTTP interface port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `http` (default) or `https`.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Database name.
    pub database: String,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Run DDL `ON CLUSTER` and maintain replicated/distributed pairs.
    #[serde(default)]
    pub cluster: Option<String>,
}

fn default_port() -> u16 {
    8123
}

struct Core {
    client: reqwest::Client,
    url: String,
    config: ClickHouseConfig,
    dialect: Dialect,
    retry: RetryPolicy,
}

impl Core {
    async fn execute(&self, sql: &str) -> Result<String> {
        self.request(sql, None).await
    }

    async fn execute_with_body(&self, sql: &str, body: String) -> Result<String> {
        self.request(sql, Some(body)).await
    }

    /// One HTTP round-trip; transient failures retry with backoff.
    async fn request(&self, sql: &str, body: Option<String>) -> Result<String> {
        let this = self;
        with_retries(self.retry, "clickhouse query", move || {
            let body = body.clone();
            async move { this.request_once(sql, body).await }
        })
        .await
    }

    async fn request_once(&self, sql: &str, body: Option<String>) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .query(&[
                ("database", self.config.database.as_str()),
                ("date_time_input_format", "best_effort"),
                ("output_format_json_quote_64bit_integers", "0"),
                ("mutations_sync", "2"),
            ])
            .basic_auth(&self.config.username, Some(&self.config.password));
        request = match body {
            Some(data) => request
                .query(&[("query", sql)])
                .body(data),
            None => request.body(sql.to_owned()),
        };
        let response = request.send().await.map_err(|e| {
            Error::backend_with_source(ErrorKind::Connection, "clickhouse request", e)
        })?;

        let status = response.status();
        let exception_code: Option<i64> = response
            .headers()
            .get("x-clickhouse-exception-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let text = response.text().await.map_err(|e| {
            Error::backend_with_source(ErrorKind::Connection, "clickhouse response", e)
        })?;

        if let Some(code) = exception_code {
            return Err(Error::backend(
                classify_clickhouse(code),
                format!("clickhouse exception {code}: {}", truncate(&text)),
            ));
        }
        if !status.is_success() {
            return Err(Error::backend(
                classify_http_status(status.as_u16()),
                format!("clickhouse http {status}: {}", truncate(&text)),
            ));
        }
        Ok(text)
    }

    fn on_cluster(&self) -> String {
        self.config
            .cluster
            .as_ref()
            .map(|c| format!(" ON CLUSTER {}", self.dialect.quote_ident(c)))
            .unwrap_or_default()
    }

    /// The physical table holding data: `<name>_shard` under a cluster,
    /// the logical name otherwise.
    fn local_name(&self, table_name: &str) -> String {
        if self.config.cluster.is_some() {
            format!("{table_name}_shard")
        } else {
            table_name.to_owned()
        }
    }

    /// DDL targets for statements that must hit every physical table.
    fn ddl_targets(&self, table_name: &str) -> Vec<String> {
        if self.config.cluster.is_some() {
            vec![self.local_name(table_name), table_name.to_owned()]
        } else {
            vec![table_name.to_owned()]
        }
    }

    fn column_ddl(&self, name: &str, column: &Column, table: &Table) -> String {
        let base_type = if column.ddl_type().is_empty() {
            self.dialect.sql_type(column.data_type).to_owned()
        } else {
            column.ddl_type().to_owned()
        };
        // ORDER BY keys cannot be nullable
        let ddl_type = if table.pk_fields.contains(name) {
            base_type
        } else {
            format!("Nullable({base_type})")
        };
        format!("{} {ddl_type}", self.dialect.quote_ident(name))
    }

    fn engine(&self, table: &Table) -> String {
        let replacing = !table.pk_fields.is_empty();
        match (&self.config.cluster, replacing) {
            (Some(_), true) => {
                "ReplicatedReplacingMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}')"
                    .to_owned()
            }
            (Some(_), false) => {
                "ReplicatedMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}')"
                    .to_owned()
            }
            (None, true) => "ReplacingMergeTree()".to_owned(),
            (None, false) => "MergeTree()".to_owned(),
        }
    }

    fn order_by(&self, table: &Table) -> String {
        if table.pk_fields.is_empty() {
            "tuple()".to_owned()
        } else {
            let fields: Vec<String> = table
                .pk_fields
                .iter()
                .map(|f| self.dialect.quote_ident(f))
                .collect();
            format!("({})", fields.join(", "))
        }
    }

    /// Renders one JSONEachRow line with values coerced to column types.
    fn render_row(&self, table: &Table, row: &Record) -> Result<String> {
        let mut out = Record::new();
        for (name, value) in row {
            let data_type = table
                .columns
                .get(name)
                .map_or(DataType::Unknown, |c| c.data_type);
            out.insert(name.clone(), coerce(value, data_type));
        }
        serde_json::to_string(&out).map_err(|e| Error::Serialization {
            message: format!("encode row: {e}"),
        })
    }
}

fn truncate(text: &str) -> &str {
    let limit = 500.min(text.len());
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn reverse_type(ch_type: &str) -> DataType {
    let bare = ch_type
        .strip_prefix("Nullable(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(ch_type);
    match bare {
        t if t.starts_with("Int") || t.starts_with("UInt") => DataType::Int64,
        t if t.starts_with("Float") => DataType::Float64,
        "Bool" => DataType::Bool,
        t if t.starts_with("DateTime") => DataType::Timestamp,
        t if t.starts_with("JSON") => DataType::Json,
        _ => DataType::String,
    }
}

#[derive(Debug, Deserialize)]
struct JsonPayload {
    #[serde(default)]
    data: Vec<serde_json::Map<String, Value>>,
}

/// ClickHouse destination adapter.
pub struct ClickHouseAdapter {
    core: Arc<Core>,
}

impl ClickHouseAdapter {
    /// Builds the HTTP client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when parameters are malformed.
    pub fn connect(config: &DestinationConfig) -> Result<Self> {
        let params: ClickHouseConfig = config.parameters_as()?;
        let protocol = params.protocol.clone().unwrap_or_else(|| "http".into());
        let url = format!("{protocol}://{}:{}/", params.host, params.port);
        Ok(Self {
            core: Arc::new(Core {
                client: reqwest::Client::new(),
                url,
                config: params,
                dialect: Dialect::clickhouse(),
                retry: RetryPolicy::default(),
            }),
        })
    }
}

#[async_trait]
impl SqlAdapter for ClickHouseAdapter {
    fn backend(&self) -> Backend {
        Backend::Clickhouse
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
            "CREATE DATABASE IF NOT EXISTS {}{}",
            self.core.dialect.quote_ident(&self.core.config.database),
            self.core.on_cluster()
        );
        // the database selector must not point at the database being created
        let this = &self.core;
        let response = this
            .client
            .post(&this.url)
            .basic_auth(&this.config.username, Some(&this.config.password))
            .body(sql)
            .send()
            .await
            .map_err(|e| Error::backend_with_source(ErrorKind::Connection, "clickhouse request", e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::backend(
                classify_http_status(status),
                format!("create database failed: {}", truncate(&text)),
            ));
        }
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(ClickHouseSession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: false,
        }))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(Box::new(ClickHouseSession {
            core: Arc::clone(&self.core),
            created_tables: Vec::new(),
            transactional: true,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct ClickHouseSession {
    core: Arc<Core>,
    created_tables: Vec<String>,
    transactional: bool,
}

#[async_trait]
impl SqlSession for ClickHouseSession {
    async fn get_table_schema(&mut self, table_name: &str) -> Result<Table> {
        let mut table = Table::new(table_name);
        let sql = format!(
            "DESCRIBE TABLE {} FORMAT JSON",
            self.core.dialect.quote_ident(table_name)
        );
        let text = match self.core.execute(&sql).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::MissingTable => return Ok(table),
            Err(err) => return Err(err),
        };
        let payload: JsonPayload = serde_json::from_str(&text).map_err(|e| Error::Serialization {
            message: format!("parse describe response: {e}"),
        })?;
        for row in payload.data {
            let name = row.get("name").and_then(Value::as_str).unwrap_or_default();
            let ch_type = row.get("type").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            table.columns.insert(
                name.to_owned(),
                Column {
                    sql_type: ch_type.to_owned(),
                    data_type: reverse_type(ch_type),
                    ..Column::default()
                },
            );
        }
        if table.columns.is_empty() {
            return Ok(table);
        }

        let sql = format!(
            "SELECT primary_key FROM system.tables WHERE database = '{}' AND name = '{}' FORMAT JSON",
            self.core.config.database.replace('\'', "''"),
            self.core.local_name(table_name).replace('\'', "''"),
        );
        let text = self.core.execute(&sql).await?;
        let payload: JsonPayload = serde_json::from_str(&text).unwrap_or(JsonPayload {
            data: Vec::new(),
        });
        if let Some(pk) = payload
            .data
            .first()
            .and_then(|row| row.get("primary_key"))
            .and_then(Value::as_str)
        {
            for field in pk.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                table.pk_fields.insert(field.to_owned());
            }
        }
        if !table.pk_fields.is_empty() {
            // clickhouse has no named constraints; report a managed name so
            // diffs may reconfigure the ordering key
            table.pk_name = managed_pk_name();
        }
        Ok(table)
    }

    async fn create_table(&mut self, table: &Table) -> Result<()> {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|(name, column)| self.core.column_ddl(name, column, table))
            .collect();
        let local = self.core.local_name(&table.name);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {}{} ({}) ENGINE = {} ORDER BY {}",
            self.core.dialect.quote_ident(&local),
            self.core.on_cluster(),
            columns.join(", "),
            self.core.engine(table),
            self.core.order_by(table),
        );
        self.core.execute(&sql).await?;
        self.created_tables.push(local.clone());

        if let Some(cluster) = &self.core.config.cluster {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {}{} AS {} ENGINE = Distributed({}, {}, {}, rand())",
                self.core.dialect.quote_ident(&table.name),
                self.core.on_cluster(),
                self.core.dialect.quote_ident(&local),
                self.core.dialect.quote_ident(cluster),
                self.core.dialect.quote_ident(&self.core.config.database),
                self.core.dialect.quote_ident(&local),
            );
            self.core.execute(&sql).await?;
            self.created_tables.push(table.name.clone());
        }
        Ok(())
    }

    async fn patch_table_schema(&mut self, patch: &Table) -> Result<()> {
        for (name, column) in &patch.columns {
            for target in self.core.ddl_targets(&patch.name) {
                let sql = format!(
                    "ALTER TABLE {}{} ADD COLUMN IF NOT EXISTS {}",
                    self.core.dialect.quote_ident(&target),
                    self.core.on_cluster(),
                    self.core.column_ddl(name, column, patch),
                );
                self.core.execute(&sql).await?;
            }
        }
        // the ordering key of a MergeTree table cannot be changed in place;
        // primary-key drift is ignored here
        Ok(())
    }

    async fn insert(&mut self, table: &Table, _merge: bool, rows: &[Record]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = table
            .column_names()
            .map(|c| self.core.dialect.quote_ident(c))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            self.core.dialect.quote_ident(&table.name),
            columns.join(", ")
        );
        let mut body = String::new();
        for row in rows {
            body.push_str(&self.core.render_row(table, row)?);
            body.push('\n');
        }
        self.core.execute_with_body(&sql, body).await.map(|_| ())
    }

    async fn copy_tables(&mut self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let columns: Vec<String> = source
            .column_names()
            .map(|c| self.core.dialect.quote_ident(c))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
            self.core.dialect.quote_ident(&target.name),
            self.core.dialect.quote_ident(&source.name),
            cols = columns.join(", ")
        );
        self.core.execute(&sql).await?;
        if merge {
            // force the ReplacingMergeTree collapse; best effort
            let sql = format!(
                "OPTIMIZE TABLE {}{} FINAL",
                self.core.dialect.quote_ident(&self.core.local_name(&target.name)),
                self.core.on_cluster(),
            );
            if let Err(err) = self.core.execute(&sql).await {
                tracing::warn!(table = %target.name, error = %err, "optimize after merge failed");
            }
        }
        self.count(&target.name).await
    }

    async fn load_table(&mut self, target: &Table, source: &LoadSource) -> Result<u64> {
        let LoadSource::LocalFile { path, format } = source else {
            return Err(Error::backend(
                ErrorKind::Load,
                "clickhouse loads local batch files only",
            ));
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read batch file {}", path.display()), e))?;
        let rows = contents.lines().filter(|l| !l.is_empty()).count() as u64;
        let sql = match format {
            BatchFileFormat::Ndjson => format!(
                "INSERT INTO {} FORMAT JSONEachRow",
                self.core.dialect.quote_ident(&target.name)
            ),
            BatchFileFormat::Csv => format!(
                "INSERT INTO {} FORMAT CSVWithNames",
                self.core.dialect.quote_ident(&target.name)
            ),
        };
        let rows = match format {
            BatchFileFormat::Csv => rows.saturating_sub(1),
            BatchFileFormat::Ndjson => rows,
        };
        self.core.execute_with_body(&sql, contents).await?;
        Ok(rows)
    }

    async fn replace_table(
        &mut self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        let exists = {
            let sql = format!(
                "EXISTS TABLE {} FORMAT JSON",
                self.core.dialect.quote_ident(target_name)
            );
            let text = self.core.execute(&sql).await?;
            let payload: JsonPayload =
                serde_json::from_str(&text).unwrap_or(JsonPayload { data: Vec::new() });
            payload
                .data
                .first()
                .and_then(|row| row.get("result"))
                .and_then(Value::as_i64)
                .unwrap_or(0)
                == 1
        };

        if exists {
            let replacement_exists = {
                let sql = format!(
                    "EXISTS TABLE {} FORMAT JSON",
                    self.core.dialect.quote_ident(&replacement.name)
                );
                let text = self.core.execute(&sql).await?;
                let payload: JsonPayload =
                    serde_json::from_str(&text).unwrap_or(JsonPayload { data: Vec::new() });
                payload
                    .data
                    .first()
                    .and_then(|row| row.get("result"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    == 1
            };
            // a previous attempt whose drop step failed already completed
            // the swap
            if !replacement_exists {
                return Ok(());
            }
        }

        let deprecated = deprecated_table_name(target_name);
        if exists {
            for (from, to) in self
                .core
                .ddl_targets(target_name)
                .into_iter()
                .zip(self.core.ddl_targets(&deprecated))
            {
                let sql = format!(
                    "RENAME TABLE {} TO {}{}",
                    self.core.dialect.quote_ident(&from),
                    self.core.dialect.quote_ident(&to),
                    self.core.on_cluster(),
                );
                self.core.execute(&sql).await?;
            }
        }
        for (from, to) in self
            .core
            .ddl_targets(&replacement.name)
            .into_iter()
            .zip(self.core.ddl_targets(target_name))
        {
            let sql = format!(
                "RENAME TABLE {} TO {}{}",
                self.core.dialect.quote_ident(&from),
                self.core.dialect.quote_ident(&to),
                self.core.on_cluster(),
            );
            self.core.execute(&sql).await?;
        }
        if drop_old && exists {
            self.drop_table(&deprecated, true)
                .await
                .map_err(|e| Error::backend(ErrorKind::Drop, e.to_string()))?;
        }
        Ok(())
    }

    async fn truncate_table(&mut self, table_name: &str) -> Result<()> {
        let sql = format!(
            "TRUNCATE TABLE {}{}",
            self.core
                .dialect
                .quote_ident(&self.core.local_name(table_name)),
            self.core.on_cluster(),
        );
        self.core.execute(&sql).await.map(|_| ())
    }

    async fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<()> {
        let clause = if if_exists { "IF EXISTS " } else { "" };
        for target in self.core.ddl_targets(table_name) {
            let sql = format!(
                "DROP TABLE {clause}{}{}",
                self.core.dialect.quote_ident(&target),
                self.core.on_cluster(),
            );
            self.core.execute(&sql).await?;
        }
        Ok(())
    }

    async fn delete_partition(&mut self, table_name: &str, partition_id: &str) -> Result<u64> {
        let sql = format!(
            "ALTER TABLE {}{} DELETE WHERE {} = {}",
            self.core
                .dialect
                .quote_ident(&self.core.local_name(table_name)),
            self.core.on_cluster(),
            self.core.dialect.quote_ident(PARTITION_ID_COLUMN),
            self.core.dialect.string_literal(partition_id),
        );
        self.core.execute(&sql).await?;
        Ok(0)
    }

    async fn widen_column_to_string(&mut self, table_name: &str, column: &str) -> Result<()> {
        for target in self.core.ddl_targets(table_name) {
            let sql = format!(
                "ALTER TABLE {}{} MODIFY COLUMN {} Nullable(String)",
                self.core.dialect.quote_ident(&target),
                self.core.on_cluster(),
                self.core.dialect.quote_ident(column),
            );
            self.core.execute(&sql).await?;
        }
        Ok(())
    }

    async fn count(&mut self, table_name: &str) -> Result<u64> {
        let sql = format!(
            "SELECT count() AS c FROM {} FORMAT JSON",
            self.core.dialect.quote_ident(table_name)
        );
        let text = self.core.execute(&sql).await?;
        let payload: JsonPayload = serde_json::from_str(&text).map_err(|e| Error::Serialization {
            message: format!("parse count response: {e}"),
        })?;
        Ok(payload
            .data
            .first()
            .and_then(|row| row.get("c"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn select_all(&mut self, table_name: &str) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT * FROM {} FORMAT JSON",
            self.core.dialect.quote_ident(table_name)
        );
        let text = self.core.execute(&sql).await?;
        let payload: JsonPayload = serde_json::from_str(&text).map_err(|e| Error::Serialization {
            message: format!("parse select response: {e}"),
        })?;
        Ok(payload.data)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if self.transactional {
            let created = std::mem::take(&mut self.created_tables);
            for table in created.into_iter().rev() {
                let sql = format!(
                    "DROP TABLE IF EXISTS {}{}",
                    self.core.dialect.quote_ident(&table),
                    self.core.on_cluster(),
                );
                if let Err(err) = self.core.execute(&sql).await {
                    tracing::warn!(table = %table, error = %err, "rollback cleanup failed");
                }
            }
        }
        Ok(())
    }
}
