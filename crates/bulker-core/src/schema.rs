//! Destination table model and schema diff.
//!
//! A [`Table`] is the pipeline's view of a warehouse table: columns with both
//! canonical and backend SQL types, the primary-key set, and partitioning
//! metadata. [`Table::diff`] computes the minimal additive change needed for
//! an existing table to accept a new record's schema.
//!
//! Primary-key constraints created by bulker carry the [`MANAGED_PK_PREFIX`]
//! so a later diff can tell them apart from user-defined constraints: managed
//! constraints may be dropped and recreated on drift, anything else is left
//! alone.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::DataType;

/// Prefix of primary-key constraint names managed by bulker.
pub const MANAGED_PK_PREFIX: &str = "jitsu_pk_";

/// Prefix of session-scoped staging tables.
pub const TEMP_TABLE_PREFIX: &str = "jitsu_tmp_";

/// Reserved column stamped with the partition id in replace-partition mode.
pub const PARTITION_ID_COLUMN: &str = "__partition_id";

/// Reserved column holding fields diverted after a type-mismatch in
/// auto-commit mode.
pub const UNMAPPED_DATA_COLUMN: &str = "_unmapped_data";

/// Generates a fresh bulker-managed primary-key constraint name.
#[must_use]
pub fn managed_pk_name() -> String {
    format!("{MANAGED_PK_PREFIX}{}", random_suffix(12))
}

/// Returns true if the constraint name is managed by bulker.
///
/// Case-insensitive: some backends fold identifier case.
#[must_use]
pub fn is_managed_pk(name: &str) -> bool {
    name.to_lowercase().starts_with(MANAGED_PK_PREFIX)
}

/// Generates a lowercase alphanumeric suffix for table and constraint names.
#[must_use]
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect()
}

/// One column of a destination table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Column {
    /// Backend SQL type used for casts and comparisons.
    pub sql_type: String,
    /// Distinct type used in DDL, when it differs from `sql_type`.
    pub ddl_type: Option<String>,
    /// Canonical data type.
    pub data_type: DataType,
    /// Pinned by an external hint; inference must not widen it.
    pub override_type: bool,
    /// Not yet committed to the warehouse schema.
    pub new: bool,
}

impl Column {
    /// Creates a column holding only an inferred canonical type; the SQL
    /// type is filled in by the destination dialect.
    #[must_use]
    pub fn of(data_type: DataType) -> Self {
        Self {
            data_type,
            ..Self::default()
        }
    }

    /// Returns the type to use when issuing DDL.
    #[must_use]
    pub fn ddl_type(&self) -> &str {
        self.ddl_type.as_deref().unwrap_or(&self.sql_type)
    }
}

/// Externally supplied SQL type hints, keyed by column name.
///
/// Hints take precedence over inferred types for the columns they name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeHints(BTreeMap<String, TypeHint>);

/// One externally supplied SQL type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeHint {
    /// Backend SQL type.
    pub sql_type: String,
    /// Distinct DDL type, when it differs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddl_type: Option<String>,
}

impl TypeHints {
    /// Creates an empty hint set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hint, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.0.insert(
            name.into(),
            TypeHint {
                sql_type: sql_type.into(),
                ddl_type: None,
            },
        );
        self
    }

    /// Adds a hint with a distinct DDL type, builder style.
    #[must_use]
    pub fn with_ddl(
        mut self,
        name: impl Into<String>,
        sql_type: impl Into<String>,
        ddl_type: impl Into<String>,
    ) -> Self {
        self.0.insert(
            name.into(),
            TypeHint {
                sql_type: sql_type.into(),
                ddl_type: Some(ddl_type.into()),
            },
        );
        self
    }

    /// Looks up a hint by column name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TypeHint> {
        self.0.get(name)
    }

    /// Iterates over all hints.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TypeHint)> {
        self.0.iter()
    }

    /// Returns true if no hints are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Time granularity of a date-partitioned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One partition per hour.
    Hour,
    /// One partition per day.
    Day,
    /// One partition per month.
    Month,
    /// One partition per year.
    Year,
}

/// Partition specification of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatePartition {
    /// The partitioning column.
    pub field: String,
    /// Partition granularity.
    pub granularity: Granularity,
}

/// The pipeline's representation of a destination table.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Table name, unquoted.
    pub name: String,
    /// Session-scoped staging table.
    pub temporary: bool,
    /// Snapshot came from the table-helper cache rather than the backend.
    pub cached: bool,
    /// Columns, keyed by name. B-tree backed: iteration order is the sorted
    /// column order used by batch files and generated statements.
    pub columns: BTreeMap<String, Column>,
    /// Primary-key column set.
    pub pk_fields: BTreeSet<String>,
    /// Primary-key constraint name; stable while `pk_fields` is non-empty.
    pub pk_name: String,
    /// Column carrying the event timestamp, when configured.
    pub timestamp_column: String,
    /// Partition specification, when the table is partitioned.
    pub partition: Option<DatePartition>,
    /// Set by diff when the existing primary key must be dropped before the
    /// new one is created.
    pub delete_pk_fields: bool,
}

impl Table {
    /// Creates an empty table with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns true if the table has any schema content.
    ///
    /// An empty result from `get_table_schema` signals a nonexistent table.
    #[must_use]
    pub fn exists(&self) -> bool {
        !self.columns.is_empty() || !self.pk_fields.is_empty() || self.delete_pk_fields
    }

    /// Returns column names in sorted order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Computes the minimal additive change making `self` accept `incoming`.
    ///
    /// Only missing columns are emitted; types are never narrowed or widened
    /// here. Primary-key reconfiguration is attempted only when the existing
    /// constraint is absent or bulker-managed; user-defined constraints are
    /// preserved untouched. When the key sets differ, `delete_pk_fields` is
    /// set so the caller drops the old constraint before creating the new one.
    #[must_use]
    pub fn diff(&self, incoming: &Self) -> Self {
        let mut diff = Self::new(self.name.clone());

        if !incoming.exists() {
            return diff;
        }

        for (name, column) in &incoming.columns {
            if !self.columns.contains_key(name) {
                diff.columns.insert(name.clone(), column.clone());
            }
        }

        if !self.pk_name.is_empty() && !is_managed_pk(&self.pk_name) {
            return diff;
        }

        if self.pk_fields.is_empty() {
            if !incoming.pk_fields.is_empty() {
                diff.pk_fields = incoming.pk_fields.clone();
                diff.pk_name = managed_pk_name();
            }
        } else if self.pk_fields != incoming.pk_fields {
            diff.delete_pk_fields = true;
            diff.pk_fields = incoming.pk_fields.clone();
            if !incoming.pk_fields.is_empty() {
                diff.pk_name = managed_pk_name();
            }
        }

        diff
    }

    /// Returns true if every column of `self` exists in `destination`.
    #[must_use]
    pub fn fits_to(&self, destination: &Self) -> bool {
        self.columns
            .keys()
            .all(|name| destination.columns.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, columns: &[&str], pks: &[&str], pk_name: &str) -> Table {
        let mut t = Table::new(name);
        for c in columns {
            t.columns
                .insert((*c).to_owned(), Column::of(DataType::String));
        }
        t.pk_fields = pks.iter().map(|s| (*s).to_owned()).collect();
        t.pk_name = pk_name.to_owned();
        t
    }

    #[test]
    fn diff_adds_only_missing_columns() {
        let current = table("events", &["id", "name"], &[], "");
        let incoming = table("events", &["id", "name", "email"], &[], "");
        let diff = current.diff(&incoming);
        assert_eq!(diff.column_names().collect::<Vec<_>>(), vec!["email"]);
        assert!(!diff.delete_pk_fields);
    }

    #[test]
    fn diff_of_identical_tables_is_empty() {
        let current = table("events", &["id", "name"], &["id"], "jitsu_pk_abc");
        let diff = current.diff(&current.clone());
        assert!(!diff.exists());
    }

    #[test]
    fn diff_recreates_managed_pk_on_drift() {
        let current = table("events", &["id", "tenant"], &["id"], "jitsu_pk_abc");
        let incoming = table("events", &["id", "tenant"], &["id", "tenant"], "");
        let diff = current.diff(&incoming);
        assert!(diff.delete_pk_fields);
        assert_eq!(
            diff.pk_fields.iter().collect::<Vec<_>>(),
            vec!["id", "tenant"]
        );
        assert!(is_managed_pk(&diff.pk_name));
    }

    #[test]
    fn diff_preserves_user_defined_pk() {
        let current = table("events", &["id"], &["id"], "events_pkey");
        let incoming = table("events", &["id", "v"], &["id", "v"], "");
        let diff = current.diff(&incoming);
        assert_eq!(diff.column_names().collect::<Vec<_>>(), vec!["v"]);
        assert!(!diff.delete_pk_fields);
        assert!(diff.pk_fields.is_empty());
    }

    #[test]
    fn diff_creates_pk_when_absent() {
        let current = table("events", &["id"], &[], "");
        let incoming = table("events", &["id"], &["id"], "");
        let diff = current.diff(&incoming);
        assert!(!diff.delete_pk_fields);
        assert_eq!(diff.pk_fields.iter().collect::<Vec<_>>(), vec!["id"]);
        assert!(is_managed_pk(&diff.pk_name));
    }

    #[test]
    fn diff_against_nonexistent_incoming_is_empty() {
        let current = table("events", &["id"], &["id"], "jitsu_pk_x");
        let diff = current.diff(&Table::new("events"));
        assert!(!diff.exists());
    }

    #[test]
    fn apply_diff_covers_incoming_columns() {
        let current = table("events", &["id"], &[], "");
        let incoming = table("events", &["id", "a", "b"], &[], "");
        let diff = current.diff(&incoming);
        let mut applied = current;
        applied.columns.extend(diff.columns);
        assert!(incoming.fits_to(&applied));
    }

    #[test]
    fn managed_pk_recognition_is_case_insensitive() {
        assert!(is_managed_pk("jitsu_pk_abc123"));
        assert!(is_managed_pk("JITSU_PK_ABC123"));
        assert!(!is_managed_pk("events_pkey"));
        assert!(is_managed_pk(&managed_pk_name()));
    }

    #[test]
    fn random_suffix_is_identifier_safe() {
        let s = random_suffix(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
