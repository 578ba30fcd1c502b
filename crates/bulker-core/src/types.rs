//! Canonical data types and value reformatting.
//!
//! Incoming records are loosely typed JSON. Every value is narrowed into one
//! of the canonical [`DataType`]s; per-column types are then coalesced across
//! a batch with [`DataType::join`], the least-common-type lattice. The lattice
//! guarantees a batch that saw `7` and `"str"` in one column lands on a
//! `String` column that stores both losslessly.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::fmt;

/// A single ingested record: an unordered mapping from column path to value.
///
/// Backed by a B-tree map, so key iteration is always alphabetically
/// sorted; the batch-file wire formats depend on this.
pub type Record = serde_json::Map<String, Value>;

/// Canonical data types records are inferred into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// Not yet known (null values); identity element of the lattice.
    #[default]
    Unknown,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// Unicode string; top of the lattice.
    String,
    /// Timestamp with timezone, normalized to RFC 3339 UTC.
    Timestamp,
    /// Nested JSON stored as-is by backends that support it.
    Json,
}

impl DataType {
    /// Returns the least common type of `self` and `other`.
    ///
    /// `Unknown` joined with anything yields the other side; every pair
    /// without a more specific join widens to `String`.
    #[must_use]
    pub const fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unknown, t) | (t, Self::Unknown) => t,
            (Self::Int64, Self::Int64) => Self::Int64,
            (Self::Int64 | Self::Float64, Self::Float64)
            | (Self::Float64, Self::Int64) => Self::Float64,
            (Self::Bool, Self::Bool) => Self::Bool,
            (Self::Timestamp, Self::Timestamp) => Self::Timestamp,
            (Self::Json, Self::Json) => Self::Json,
            _ => Self::String,
        }
    }

    /// Returns the canonical upper-case name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Bool => "BOOL",
            Self::Int64 => "INT64",
            Self::Float64 => "FLOAT64",
            Self::String => "STRING",
            Self::Timestamp => "TIMESTAMP",
            Self::Json => "JSON",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrows a raw value into its canonical type and normalized representation.
///
/// String-encoded integers, floats, and booleans are narrowed only when the
/// text round-trips losslessly (`"7"` narrows, `"007"` stays a string), so a
/// column that later widens back to `String` can re-render the original
/// bytes. Timestamps are normalized to RFC 3339 UTC.
#[must_use]
pub fn reformat(value: &Value) -> (DataType, Value) {
    match value {
        Value::Null => (DataType::Unknown, Value::Null),
        Value::Bool(b) => (DataType::Bool, Value::Bool(*b)),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                (DataType::Int64, value.clone())
            } else {
                (DataType::Float64, value.clone())
            }
        }
        Value::String(s) => reformat_string(s),
        Value::Object(_) | Value::Array(_) => (DataType::Json, value.clone()),
    }
}

/// Infers the canonical type of a value without normalizing it.
#[must_use]
pub fn infer_type(value: &Value) -> DataType {
    reformat(value).0
}

fn reformat_string(s: &str) -> (DataType, Value) {
    if let Some(ts) = parse_timestamp(s) {
        return (
            DataType::Timestamp,
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }
    if let Ok(i) = s.parse::<i64>() {
        if i.to_string() == s {
            return (DataType::Int64, Value::from(i));
        }
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                if n.to_string() == s {
                    return (DataType::Float64, Value::Number(n));
                }
            }
        }
    }
    match s {
        "true" => (DataType::Bool, Value::Bool(true)),
        "false" => (DataType::Bool, Value::Bool(false)),
        _ => (DataType::String, Value::String(s.to_owned())),
    }
}

/// Parses the timestamp formats accepted on ingest.
///
/// RFC 3339 plus the common `YYYY-MM-DD HH:MM:SS[.frac]` form (assumed UTC).
/// Bare dates are intentionally not timestamps.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Coerces a value to fit a committed column type, best effort.
///
/// Used at bind/load time once the batch-wide column type is decided: a
/// narrowed `7` going into a `String` column is re-rendered as `"7"`.
/// Values that cannot be converted are passed through unchanged and left
/// for the backend to reject.
#[must_use]
pub fn coerce(value: &Value, target: DataType) -> Value {
    match target {
        DataType::String | DataType::Timestamp => match value {
            Value::Null | Value::String(_) => value.clone(),
            Value::Bool(b) => Value::String(b.to_string()),
            Value::Number(n) => Value::String(n.to_string()),
            other => Value::String(other.to_string()),
        },
        DataType::Int64 => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => value.clone(),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .and_then(|f| {
                    if f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        #[allow(clippy::cast_possible_truncation)]
                        Some(Value::from(f as i64))
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| value.clone()),
            Value::String(s) => s
                .parse::<i64>()
                .map_or_else(|_| value.clone(), Value::from),
            _ => value.clone(),
        },
        DataType::Float64 => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| value.clone(), Value::Number),
            _ => value.clone(),
        },
        DataType::Bool => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) if s == "true" => Value::Bool(true),
            Value::String(s) if s == "false" => Value::Bool(false),
            _ => value.clone(),
        },
        DataType::Json | DataType::Unknown => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_matches_lattice_table() {
        use DataType::{Bool, Float64, Int64, String, Timestamp};
        let cases = [
            (Int64, Int64, Int64),
            (Int64, Float64, Float64),
            (Int64, Bool, String),
            (Int64, String, String),
            (Int64, Timestamp, String),
            (Float64, Float64, Float64),
            (Float64, Bool, String),
            (Float64, String, String),
            (Float64, Timestamp, String),
            (Bool, Bool, Bool),
            (Bool, String, String),
            (Bool, Timestamp, String),
            (Timestamp, Timestamp, Timestamp),
            (Timestamp, String, String),
        ];
        for (a, b, expected) in cases {
            assert_eq!(a.join(b), expected, "join({a}, {b})");
            assert_eq!(b.join(a), expected, "join({b}, {a})");
        }
    }

    #[test]
    fn unknown_is_identity() {
        for t in [
            DataType::Unknown,
            DataType::Bool,
            DataType::Int64,
            DataType::Float64,
            DataType::String,
            DataType::Timestamp,
            DataType::Json,
        ] {
            assert_eq!(DataType::Unknown.join(t), t);
            assert_eq!(t.join(DataType::Unknown), t);
        }
    }

    #[test]
    fn json_widens_to_string_against_scalars() {
        assert_eq!(DataType::Json.join(DataType::Int64), DataType::String);
        assert_eq!(DataType::Json.join(DataType::Json), DataType::Json);
    }

    #[test]
    fn reformat_narrows_lossless_strings() {
        assert_eq!(reformat(&json!("7")), (DataType::Int64, json!(7)));
        assert_eq!(reformat(&json!("3.14")), (DataType::Float64, json!(3.14)));
        assert_eq!(reformat(&json!("1.0")), (DataType::Float64, json!(1.0)));
        assert_eq!(reformat(&json!("true")), (DataType::Bool, json!(true)));
    }

    #[test]
    fn reformat_keeps_lossy_strings() {
        assert_eq!(reformat(&json!("007")).0, DataType::String);
        assert_eq!(reformat(&json!("1.10")).0, DataType::String);
        assert_eq!(reformat(&json!("TRUE")).0, DataType::String);
        assert_eq!(reformat(&json!("str")).0, DataType::String);
        assert_eq!(reformat(&json!("")).0, DataType::String);
    }

    #[test]
    fn reformat_normalizes_timestamps() {
        let (t, v) = reformat(&json!("2022-08-18T14:17:22+02:00"));
        assert_eq!(t, DataType::Timestamp);
        assert_eq!(v, json!("2022-08-18T12:17:22Z"));

        let (t, _) = reformat(&json!("2022-08-18 14:17:22"));
        assert_eq!(t, DataType::Timestamp);

        // Bare dates stay strings.
        assert_eq!(reformat(&json!("2022-08-18")).0, DataType::String);
    }

    #[test]
    fn reformat_native_values() {
        assert_eq!(reformat(&json!(7)).0, DataType::Int64);
        assert_eq!(reformat(&json!(3.14)).0, DataType::Float64);
        assert_eq!(reformat(&json!(false)).0, DataType::Bool);
        assert_eq!(reformat(&Value::Null).0, DataType::Unknown);
        assert_eq!(reformat(&json!({"a": 1})).0, DataType::Json);
        assert_eq!(reformat(&json!([1, 2])).0, DataType::Json);
    }

    #[test]
    fn coerce_renders_original_text_for_string_columns() {
        assert_eq!(coerce(&json!(7), DataType::String), json!("7"));
        assert_eq!(coerce(&json!(3.14), DataType::String), json!("3.14"));
        assert_eq!(coerce(&json!(true), DataType::String), json!("true"));
        assert_eq!(coerce(&json!("str"), DataType::String), json!("str"));
        assert_eq!(coerce(&Value::Null, DataType::String), Value::Null);
    }

    #[test]
    fn coerce_numeric_targets() {
        assert_eq!(coerce(&json!("9"), DataType::Int64), json!(9));
        assert_eq!(coerce(&json!(7.0), DataType::Int64), json!(7));
        assert_eq!(coerce(&json!(7), DataType::Float64), json!(7));
        assert_eq!(coerce(&json!("1.5"), DataType::Float64), json!(1.5));
        // Unconvertible values pass through for the backend to reject.
        assert_eq!(coerce(&json!("a"), DataType::Int64), json!("a"));
    }
}
