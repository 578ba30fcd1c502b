//! # bulker-core
//!
//! Core primitives for the bulker ingestion pipeline.
//!
//! This crate provides the foundational types shared by every destination
//! backend:
//!
//! - **Canonical Data Types**: the small type system records are inferred
//!   into, with a least-common-type lattice used for schema coalescing
//! - **Flattening**: conversion of nested records into flat column paths
//! - **Table Model**: destination table representation and additive diff
//! - **Batch Files**: the local staging files flushed by bulk loads
//! - **Stream Options & State**: the programmatic surface of a stream
//! - **Error Taxonomy**: classified errors the stream state machine acts on
//!
//! ## Crate Boundary
//!
//! `bulker-core` is the only crate allowed to define shared primitives.
//! It knows nothing about concrete warehouses; backend-specific behavior
//! lives behind the adapter contract in `bulker-sql`.
//!
//! ## Example
//!
//! ```rust
//! use bulker_core::prelude::*;
//! use serde_json::json;
//!
//! let record = json!({"user": {"id": 42}, "tags": ["a", "b"]});
//! let flat = NestedFlattener::default()
//!     .flatten(record.as_object().unwrap().clone())
//!     .unwrap();
//! assert_eq!(flat["user_id"], json!(42));
//! assert_eq!(flat["tags"], json!("[\"a\",\"b\"]"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch_file;
pub mod error;
pub mod flatten;
pub mod options;
pub mod schema;
pub mod types;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use bulker_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::batch_file::{BatchFileFormat, BatchFileWriter, LoadSource};
    pub use crate::error::{Error, ErrorKind, Recommendation, Result};
    pub use crate::flatten::{DummyFlattener, Flattener, NestedFlattener};
    pub use crate::options::{BulkMode, StreamOptions, StreamState, StreamStatus};
    pub use crate::schema::{Column, DatePartition, Granularity, Table, TypeHint, TypeHints};
    pub use crate::types::{reformat, DataType, Record};
}

pub use error::{Error, ErrorKind, Recommendation, Result};
pub use types::Record;
