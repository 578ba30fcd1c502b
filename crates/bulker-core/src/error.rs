//! Error types and the classification taxonomy.
//!
//! Every fallible operation in the pipeline returns a classified error. The
//! stream state machine acts on [`ErrorKind`]s, never on message text: a
//! `MissingColumn` triggers a schema re-ensure, a `Drop` during a table swap
//! falls through to the non-drop variant, a `Fatal` terminates the stream.
//!
//! Backend adapters are responsible for mapping driver errors (SQLSTATEs,
//! MySQL error numbers, HTTP error payloads) into this taxonomy.

use std::fmt;

/// The result type used throughout bulker.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified kinds of backend failures.
///
/// Kinds, not types: the same driver error surfaces differently per backend,
/// and the state machine only ever branches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The destination is unreachable or the connection dropped mid-flight.
    Connection,
    /// Credentials were rejected.
    Auth,
    /// Credentials are valid but lack rights for the operation.
    Permission,
    /// The destination rejected the operation due to quota or rate limits.
    Quota,
    /// The generated statement was rejected as malformed.
    Syntax,
    /// A value did not fit the destination column type.
    TypeMismatch,
    /// The target table does not exist.
    MissingTable,
    /// A referenced column does not exist.
    MissingColumn,
    /// A uniqueness constraint was violated.
    UniqueViolation,
    /// Dropping a table failed; the surrounding operation may still be
    /// treated as complete.
    Drop,
    /// A bulk load from a staged file failed.
    Load,
    /// A transient failure that is expected to succeed on retry.
    Transient,
    /// Unrecoverable; terminates the stream.
    Fatal,
}

impl ErrorKind {
    /// Returns what the caller should do about an error of this kind.
    #[must_use]
    pub const fn recommendation(self) -> Recommendation {
        match self {
            Self::Connection | Self::Transient => Recommendation::Retry,
            Self::Quota | Self::Load => Recommendation::RetrySmaller,
            Self::Auth
            | Self::Permission
            | Self::Syntax
            | Self::TypeMismatch
            | Self::MissingTable
            | Self::MissingColumn
            | Self::Drop => Recommendation::Surface,
            Self::UniqueViolation | Self::Fatal => Recommendation::Abort,
        }
    }

    /// Returns the snake_case name used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Quota => "quota",
            Self::Syntax => "syntax",
            Self::TypeMismatch => "type_mismatch",
            Self::MissingTable => "missing_table",
            Self::MissingColumn => "missing_column",
            Self::UniqueViolation => "unique_violation",
            Self::Drop => "drop",
            Self::Load => "load",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do in response to a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    /// Retry the same operation, with backoff.
    Retry,
    /// Retry with a smaller batch.
    RetrySmaller,
    /// Report to the caller; the stream may continue.
    Surface,
    /// Terminate the stream.
    Abort,
}

/// Errors that can occur anywhere in the bulker pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two record keys mapped to the same column path after sanitization.
    #[error("flattened key collision on column {key}")]
    KeyCollision {
        /// The colliding column path.
        key: String,
    },

    /// `Consume` was called on a stream in a terminal state.
    #[error("stream is closed")]
    StreamClosed,

    /// The backend cannot run in auto-commit (`Stream`) mode.
    #[error("{backend} does not support auto-commit streams")]
    AutocommitUnsupported {
        /// Backend type id.
        backend: String,
    },

    /// Stream options are inconsistent or incomplete.
    #[error("invalid stream options: {message}")]
    InvalidOptions {
        /// Description of what made the options invalid.
        message: String,
    },

    /// Destination configuration could not be parsed or is incomplete.
    #[error("destination config error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A batch-file or filesystem operation failed.
    #[error("io error: {message}")]
    Io {
        /// Description of the failed operation.
        message: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A classified failure reported by a destination backend.
    #[error("{kind} error: {message}")]
    Backend {
        /// The classified kind the state machine branches on.
        kind: ErrorKind,
        /// Backend-provided description.
        message: String,
        /// The underlying driver error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a classified backend error with the given message.
    #[must_use]
    pub fn backend(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a classified backend error with a source cause.
    #[must_use]
    pub fn backend_with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an io error with context about the failed operation.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Returns the classified kind of this error.
    ///
    /// Non-backend errors fold into the taxonomy: malformed-record errors
    /// are `TypeMismatch` (they fail one record, not the stream), io
    /// failures during staging are `Load`, and everything else that reaches
    /// the state machine is `Fatal`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend { kind, .. } => *kind,
            Self::KeyCollision { .. } | Self::Serialization { .. } => ErrorKind::TypeMismatch,
            Self::Io { .. } => ErrorKind::Load,
            _ => ErrorKind::Fatal,
        }
    }

    /// Returns the recommendation for this error's kind.
    #[must_use]
    pub fn recommendation(&self) -> Recommendation {
        self.kind().recommendation()
    }

    /// Returns true if this error carries the given classified kind.
    #[must_use]
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }
}
