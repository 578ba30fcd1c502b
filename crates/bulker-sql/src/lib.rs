//! # bulker-sql
//!
//! SQL warehouse adapters and the stream state machine of the bulker
//! ingestion pipeline.
//!
//! This crate implements the per-destination bulk-loading core:
//!
//! - **Adapter Contract**: the capability set every backend exposes
//!   ([`SqlAdapter`] / [`SqlSession`]) and the [`Dialect`] values that drive
//!   statement generation
//! - **Backends**: postgres, mysql, redshift, snowflake, bigquery,
//!   clickhouse, plus an in-memory backend for tests
//! - **Table Helper**: cached schema arbitration under concurrent writers
//! - **Streams**: the four delivery modes (auto-commit, transactional batch,
//!   replace-table, replace-partition) with their commit/rollback protocol
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulker_core::prelude::*;
//! use bulker_sql::destination::{self, DestinationConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<()> {
//! let config: DestinationConfig = serde_json::from_value(json!({
//!     "id": "warehouse",
//!     "type": "postgres",
//!     "schema": "public",
//!     "parameters": {"host": "localhost", "database": "events"},
//! }))
//! .expect("static config");
//! let dest = destination::connect(config).await?;
//!
//! let mut stream = dest.create_stream("s1", "pages", BulkMode::Batch, StreamOptions::default())?;
//! stream
//!     .consume(json!({"id": 1, "url": "/"}).as_object().unwrap().clone())
//!     .await?;
//! let state = stream.complete().await?;
//! assert_eq!(state.status, StreamStatus::Completed);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adapter;
pub mod bigquery;
pub mod classifier;
pub mod clickhouse;
pub mod destination;
pub mod dialect;
pub mod memory;
pub mod mysql;
pub mod postgres;
pub mod redshift;
pub mod retry;
pub mod snowflake;
pub mod stream;
pub mod table_helper;

pub use adapter::{Backend, SqlAdapter, SqlSession};
pub use destination::{Destination, DestinationConfig, DestinationRegistry};
pub use dialect::Dialect;
pub use stream::BulkerStream;
pub use table_helper::TableHelper;
