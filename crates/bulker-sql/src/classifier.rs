//! Backend error classification.
//!
//! Maps driver-specific failure signals (SQLSTATEs, MySQL error numbers,
//! ClickHouse exception codes, Snowflake SQL states, BigQuery error reasons,
//! HTTP statuses) into the [`ErrorKind`] taxonomy the stream state machine
//! acts on. Unrecognized statement failures classify as `Syntax`: they
//! surface as per-record errors without terminating the stream.

use bulker_core::error::{Error, ErrorKind};

use crate::adapter::Backend;

/// Classifies a SQLSTATE (postgres, redshift).
#[must_use]
pub fn classify_sqlstate(state: &str) -> ErrorKind {
    match state {
        "42P01" => ErrorKind::MissingTable,
        "42703" => ErrorKind::MissingColumn,
        "23505" => ErrorKind::UniqueViolation,
        "42501" => ErrorKind::Permission,
        "2BP01" => ErrorKind::Drop,
        "40001" | "40P01" | "57014" | "57P03" => ErrorKind::Transient,
        "28000" | "28P01" => ErrorKind::Auth,
        "42804" => ErrorKind::TypeMismatch,
        s if s.starts_with("08") => ErrorKind::Connection,
        s if s.starts_with("53") || s.starts_with("54") => ErrorKind::Quota,
        s if s.starts_with("22") || s.starts_with("23") => ErrorKind::TypeMismatch,
        _ => ErrorKind::Syntax,
    }
}

/// Classifies a MySQL server error number.
#[must_use]
pub fn classify_mysql(errno: u32) -> ErrorKind {
    match errno {
        1146 => ErrorKind::MissingTable,
        1054 => ErrorKind::MissingColumn,
        1062 | 1169 => ErrorKind::UniqueViolation,
        1044 | 1142 | 1143 => ErrorKind::Permission,
        1045 | 1698 => ErrorKind::Auth,
        1040 | 1203 => ErrorKind::Quota,
        1205 | 1213 => ErrorKind::Transient,
        1264 | 1265 | 1292 | 1366 | 1406 | 3140 => ErrorKind::TypeMismatch,
        1064 => ErrorKind::Syntax,
        2002 | 2003 | 2006 | 2013 => ErrorKind::Connection,
        _ => ErrorKind::Syntax,
    }
}

/// Classifies a ClickHouse exception code.
#[must_use]
pub fn classify_clickhouse(code: i64) -> ErrorKind {
    match code {
        60 | 81 => ErrorKind::MissingTable,
        16 | 10 | 47 => ErrorKind::MissingColumn,
        6 | 53 | 72 | 457 => ErrorKind::TypeMismatch,
        62 | 63 => ErrorKind::Syntax,
        516 => ErrorKind::Auth,
        497 => ErrorKind::Permission,
        201 | 202 | 252 => ErrorKind::Quota,
        159 | 209 | 210 | 425 => ErrorKind::Connection,
        236 | 319 | 999 => ErrorKind::Transient,
        _ => ErrorKind::Syntax,
    }
}

/// Classifies a Snowflake SQL state.
#[must_use]
pub fn classify_snowflake(sqlstate: &str) -> ErrorKind {
    match sqlstate {
        "42S02" | "02000" => ErrorKind::MissingTable,
        "42S22" => ErrorKind::MissingColumn,
        "23001" | "23505" => ErrorKind::UniqueViolation,
        "22007" | "22018" | "22003" => ErrorKind::TypeMismatch,
        "28000" => ErrorKind::Auth,
        "42501" => ErrorKind::Permission,
        "57014" => ErrorKind::Transient,
        s if s.starts_with("08") => ErrorKind::Connection,
        s if s.starts_with("42") => ErrorKind::Syntax,
        _ => ErrorKind::Syntax,
    }
}

/// Classifies a BigQuery error reason.
#[must_use]
pub fn classify_bigquery(reason: &str) -> ErrorKind {
    match reason {
        "notFound" => ErrorKind::MissingTable,
        "invalidQuery" | "invalid" => ErrorKind::Syntax,
        "accessDenied" => ErrorKind::Permission,
        "authError" | "invalidCredentials" => ErrorKind::Auth,
        "quotaExceeded" | "rateLimitExceeded" | "billingTierLimitExceeded" => ErrorKind::Quota,
        "backendError" | "internalError" | "jobBackendError" | "jobInternalError" => {
            ErrorKind::Transient
        }
        "duplicate" => ErrorKind::UniqueViolation,
        _ => ErrorKind::Syntax,
    }
}

/// Classifies a bare HTTP status from a warehouse REST endpoint.
#[must_use]
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Auth,
        403 => ErrorKind::Permission,
        404 => ErrorKind::MissingTable,
        408 | 429 => ErrorKind::Quota,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Syntax,
    }
}

/// Converts a sqlx error into a classified [`Error`].
#[must_use]
pub fn from_sqlx(backend: Backend, context: &str, err: sqlx::Error) -> Error {
    let kind = match &err {
        sqlx::Error::Database(db) => match backend {
            Backend::Mysql => db
                .code()
                .and_then(|c| c.parse::<u32>().ok())
                .map_or(ErrorKind::Syntax, classify_mysql),
            _ => db
                .code()
                .map_or(ErrorKind::Syntax, |c| classify_sqlstate(&c)),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ErrorKind::Connection
        }
        sqlx::Error::RowNotFound => ErrorKind::MissingTable,
        _ => ErrorKind::Fatal,
    };
    Error::backend_with_source(kind, format!("{context}: {err}"), err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_sqlstates() {
        assert_eq!(classify_sqlstate("42P01"), ErrorKind::MissingTable);
        assert_eq!(classify_sqlstate("42703"), ErrorKind::MissingColumn);
        assert_eq!(classify_sqlstate("23505"), ErrorKind::UniqueViolation);
        assert_eq!(classify_sqlstate("22P02"), ErrorKind::TypeMismatch);
        assert_eq!(classify_sqlstate("08006"), ErrorKind::Connection);
        assert_eq!(classify_sqlstate("40P01"), ErrorKind::Transient);
        assert_eq!(classify_sqlstate("99999"), ErrorKind::Syntax);
    }

    #[test]
    fn mysql_error_numbers() {
        assert_eq!(classify_mysql(1146), ErrorKind::MissingTable);
        assert_eq!(classify_mysql(1054), ErrorKind::MissingColumn);
        assert_eq!(classify_mysql(1062), ErrorKind::UniqueViolation);
        assert_eq!(classify_mysql(1366), ErrorKind::TypeMismatch);
        assert_eq!(classify_mysql(1213), ErrorKind::Transient);
    }

    #[test]
    fn clickhouse_exception_codes() {
        assert_eq!(classify_clickhouse(60), ErrorKind::MissingTable);
        assert_eq!(classify_clickhouse(16), ErrorKind::MissingColumn);
        assert_eq!(classify_clickhouse(53), ErrorKind::TypeMismatch);
    }

    #[test]
    fn bigquery_reasons() {
        assert_eq!(classify_bigquery("notFound"), ErrorKind::MissingTable);
        assert_eq!(classify_bigquery("rateLimitExceeded"), ErrorKind::Quota);
        assert_eq!(classify_bigquery("backendError"), ErrorKind::Transient);
    }
}
