//! Amazon Redshift adapter.
//!
//! Redshift speaks the postgres wire protocol, so sessions are the shared
//! [`PgSession`](crate::postgres) with the redshift dialect: no `ON
//! CONFLICT` (merges run as delete+insert) and no `COPY FROM STDIN`; bulk
//! loads go through an S3-staged object referenced by a `COPY` statement,
//! with the staging treated as a pluggable load-source variant. Local batch
//! files fall back to prepared NDJSON inserts.

use async_trait::async_trait;
use serde::Deserialize;

use bulker_core::batch_file::BatchFileFormat;
use bulker_core::error::Result;

use crate::adapter::{Backend, SqlAdapter, SqlSession};
use crate::classifier::from_sqlx;
use crate::destination::DestinationConfig;
use crate::dialect::Dialect;
use crate::postgres::{build_pool, PgExec, PgSession, PostgresConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedshiftParams {
    #[serde(flatten)]
    postgres: PostgresConfig,
    /// S3 staging credentials for `COPY`.
    #[serde(default)]
    s3: Option<crate::postgres::S3CopyConfig>,
}

/// Amazon Redshift destination adapter.
pub struct RedshiftAdapter {
    pool: sqlx::PgPool,
    dialect: Dialect,
    schema: String,
    s3: Option<crate::postgres::S3CopyConfig>,
}

impl RedshiftAdapter {
    /// Connects a pool to the configured cluster.
    ///
    /// # Errors
    ///
    /// Returns a classified error when the cluster is unreachable or
    /// credentials are rejected.
    pub async fn connect(config: &DestinationConfig) -> Result<Self> {
        let params: RedshiftParams = config.parameters_as()?;
        let schema = config.schema.clone().unwrap_or_else(|| "public".into());
        let pool = build_pool(&params.postgres, &schema, Backend::Redshift).await?;
        Ok(Self {
            pool,
            dialect: Dialect::redshift(),
            schema,
            s3: params.s3,
        })
    }

    fn session(&self, exec: PgExec) -> Box<dyn SqlSession + Send + Sync> {
        Box::new(PgSession {
            exec: Some(exec),
            dialect: self.dialect.clone(),
            backend: Backend::Redshift,
            schema: self.schema.clone(),
            s3_copy: self.s3.clone(),
        })
    }
}

#[async_trait]
impl SqlAdapter for RedshiftAdapter {
    fn backend(&self) -> Backend {
        Backend::Redshift
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
            .map_err(|e| from_sqlx(Backend::Redshift, "ping", e))
    }

    async fn init_database(&self) -> Result<()> {
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.dialect.quote_ident(&self.schema)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| from_sqlx(Backend::Redshift, "init schema", e))
    }

    async fn open_session(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        Ok(self.session(PgExec::Pool(self.pool.clone())))
    }

    async fn open_tx(&self) -> Result<Box<dyn SqlSession + Send + Sync>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(Backend::Redshift, "begin", e))?;
        Ok(self.session(PgExec::Tx(tx)))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
