//! Record flattening.
//!
//! Nested records are turned into flat mappings from column path to scalar:
//! `{"user": {"id": 42}}` becomes `{"user_id": 42}`. Arrays are JSON-encoded
//! into strings, keys are sanitized to identifier-safe characters, and
//! collisions introduced by sanitization are reported rather than silently
//! overwritten.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::Record;

/// Reserved marker for per-column SQL type hints.
///
/// Values whose column path contains this marker are metadata, not data, and
/// are stored untouched by the flattener.
pub const SQL_TYPE_MARKER: &str = "__sql_type_";

/// Key assigned to a value whose key sanitized down to nothing.
const UNNAMED_KEY: &str = "_unnamed";

/// Converts a record into the flat shape the table model expects.
pub trait Flattener: Send + Sync {
    /// Flattens one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyCollision`] when two source keys map to the same
    /// column path after sanitization.
    fn flatten(&self, record: Record) -> Result<Record>;
}

/// The default flattener: recursive descent with key sanitization.
#[derive(Debug, Clone)]
pub struct NestedFlattener {
    omit_nil_values: bool,
}

impl Default for NestedFlattener {
    fn default() -> Self {
        Self {
            omit_nil_values: true,
        }
    }
}

impl NestedFlattener {
    /// Creates a flattener, keeping or omitting nil values.
    #[must_use]
    pub const fn new(omit_nil_values: bool) -> Self {
        Self { omit_nil_values }
    }

    fn walk(&self, path: &str, value: Value, out: &mut Record) -> Result<()> {
        match value {
            Value::Object(map) if !path.contains(SQL_TYPE_MARKER) => {
                for (key, nested) in map {
                    let segment = sanitize_key(&key);
                    let child = if path.is_empty() {
                        segment
                    } else if segment.is_empty() {
                        path.to_owned()
                    } else {
                        format!("{path}_{segment}")
                    };
                    self.walk(&child, nested, out)?;
                }
                Ok(())
            }
            Value::Array(_) if !path.contains(SQL_TYPE_MARKER) => {
                let encoded = serde_json::to_string(&value).map_err(|e| {
                    Error::Serialization {
                        message: format!("failed to encode array at {path}: {e}"),
                    }
                })?;
                self.emit(path, Value::String(encoded), out)
            }
            Value::Null if self.omit_nil_values => Ok(()),
            other => self.emit(path, other, out),
        }
    }

    fn emit(&self, path: &str, value: Value, out: &mut Record) -> Result<()> {
        let key = if path.is_empty() { UNNAMED_KEY } else { path };
        if out.contains_key(key) {
            return Err(Error::KeyCollision {
                key: key.to_owned(),
            });
        }
        out.insert(key.to_owned(), value);
        Ok(())
    }
}

impl Flattener for NestedFlattener {
    fn flatten(&self, record: Record) -> Result<Record> {
        let mut out = Record::new();
        self.walk("", Value::Object(record), &mut out)?;
        Ok(out)
    }
}

/// A pass-through flattener for backends that store nested JSON natively.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyFlattener;

impl Flattener for DummyFlattener {
    fn flatten(&self, record: Record) -> Result<Record> {
        Ok(record)
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flatten(value: Value) -> Result<Record> {
        NestedFlattener::default().flatten(value.as_object().expect("object").clone())
    }

    #[test]
    fn flattens_nested_and_sanitizes_keys() {
        let flat = flatten(json!({
            "$a": 1,
            "(b)": 2,
            "c": {"d": {"e": 3}},
            "arr": [1, 2],
        }))
        .expect("flatten");

        assert_eq!(flat["_a"], json!(1));
        assert_eq!(flat["_b_"], json!(2));
        assert_eq!(flat["c_d_e"], json!(3));
        assert_eq!(flat["arr"], json!("[1,2]"));
        assert_eq!(flat.len(), 4);
    }

    #[test]
    fn empty_key_becomes_unnamed() {
        let flat = flatten(json!({"": 42})).expect("flatten");
        assert_eq!(flat[UNNAMED_KEY], json!(42));
    }

    #[test]
    fn nil_values_omitted_by_default() {
        let flat = flatten(json!({"a": null, "b": 1})).expect("flatten");
        assert!(!flat.contains_key("a"));
        assert_eq!(flat.len(), 1);

        let kept = NestedFlattener::new(false)
            .flatten(json!({"a": null}).as_object().unwrap().clone())
            .expect("flatten");
        assert_eq!(kept["a"], Value::Null);
    }

    #[test]
    fn collision_after_sanitization_is_reported() {
        let err = flatten(json!({"a_b": 1, "a": {"b": 2}})).unwrap_err();
        assert!(matches!(err, Error::KeyCollision { key } if key == "a_b"));
    }

    #[test]
    fn sql_type_marker_values_left_untouched() {
        let flat = flatten(json!({
            "col__sql_type_hint": ["varchar", "varchar(42)"],
        }))
        .expect("flatten");
        assert_eq!(flat["col__sql_type_hint"], json!(["varchar", "varchar(42)"]));
    }

    #[test]
    fn flatten_is_idempotent_on_flat_records() {
        let once = flatten(json!({
            "a": 1,
            "b_c": "x",
            "arr": [1, 2],
        }))
        .expect("first");
        let twice = NestedFlattener::default()
            .flatten(once.clone())
            .expect("second");
        assert_eq!(once, twice);
    }

    #[test]
    fn dummy_flattener_passes_through() {
        let record = json!({"a": {"b": 1}}).as_object().unwrap().clone();
        let out = DummyFlattener.flatten(record.clone()).expect("flatten");
        assert_eq!(out, record);
    }
}
