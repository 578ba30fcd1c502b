//! Backend SQL dialects.
//!
//! A [`Dialect`] is a plain value describing how one backend spells SQL:
//! identifier quoting and case folding, parameter placeholders, the mapping
//! from canonical data types to DDL types, and which upsert flavor the engine
//! speaks. Adapters hold a dialect and assemble statements from it; backends
//! whose DDL diverges structurally (ClickHouse engines, BigQuery partition
//! clauses) build those statements in their own modules on top of the same
//! quoting and literal rules.

use chrono::Utc;
use serde_json::Value;

use bulker_core::schema::{Column, Table};
use bulker_core::types::DataType;

use crate::adapter::Backend;

/// Parameter placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, … (postgres wire).
    Dollar,
    /// `?` (mysql).
    Question,
}

/// Upsert flavor of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFlavor {
    /// `INSERT … ON CONFLICT (pk) DO UPDATE`.
    OnConflict,
    /// `INSERT … ON DUPLICATE KEY UPDATE`.
    OnDuplicateKey,
    /// `MERGE INTO … WHEN MATCHED / WHEN NOT MATCHED`.
    MergeInto,
    /// No native upsert: delete matching keys, then insert.
    DeleteInsert,
    /// Insert-only engine deduplicating in the background
    /// (`ReplacingMergeTree`); merge is best-effort.
    ReplacingEngine,
}

/// Table rename statement style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameStyle {
    /// `ALTER TABLE a RENAME TO b`.
    AlterTable,
    /// `RENAME TABLE a TO b`.
    RenameTable,
}

/// How one backend spells SQL.
#[derive(Debug, Clone)]
pub struct Dialect {
    /// Backend this dialect belongs to.
    pub backend: Backend,
    /// Identifier quote character.
    pub quote: char,
    /// Parameter placeholder style.
    pub placeholder: PlaceholderStyle,
    /// Unquoted identifiers fold to upper case (snowflake).
    pub folds_to_upper: bool,
    /// DDL participates in transactions.
    pub supports_transactional_ddl: bool,
    /// Columns can be widened in place (`ALTER COLUMN … TYPE`).
    pub supports_column_widening: bool,
    /// Nested JSON can be stored without flattening.
    pub stores_json_natively: bool,
    /// Placeholders carry explicit `::type` casts.
    pub cast_placeholders: bool,
    /// String literals additionally escape backslashes.
    pub escape_backslash: bool,
    /// Primary keys are declared as named constraints.
    pub named_pk_constraints: bool,
    /// Upsert flavor.
    pub merge_flavor: MergeFlavor,
    /// Rename statement style.
    pub rename_style: RenameStyle,
    type_map: fn(DataType) -> &'static str,
    pk_type_map: fn(&str) -> Option<&'static str>,
}

impl Dialect {
    /// The postgres dialect.
    #[must_use]
    pub fn postgres() -> Self {
        Self {
            backend: Backend::Postgres,
            quote: '"',
            placeholder: PlaceholderStyle::Dollar,
            folds_to_upper: false,
            supports_transactional_ddl: true,
            supports_column_widening: true,
            stores_json_natively: false,
            cast_placeholders: true,
            escape_backslash: false,
            named_pk_constraints: true,
            merge_flavor: MergeFlavor::OnConflict,
            rename_style: RenameStyle::AlterTable,
            type_map: postgres_type,
            pk_type_map: no_pk_override,
        }
    }

    /// The mysql dialect.
    #[must_use]
    pub fn mysql() -> Self {
        Self {
            backend: Backend::Mysql,
            quote: '`',
            placeholder: PlaceholderStyle::Question,
            folds_to_upper: false,
            supports_transactional_ddl: true,
            supports_column_widening: true,
            stores_json_natively: false,
            cast_placeholders: false,
            escape_backslash: true,
            named_pk_constraints: false,
            merge_flavor: MergeFlavor::OnDuplicateKey,
            rename_style: RenameStyle::RenameTable,
            type_map: mysql_type,
            pk_type_map: mysql_pk_type,
        }
    }

    /// The redshift dialect.
    #[must_use]
    pub fn redshift() -> Self {
        Self {
            backend: Backend::Redshift,
            merge_flavor: MergeFlavor::DeleteInsert,
            supports_column_widening: false,
            cast_placeholders: false,
            type_map: redshift_type,
            ..Self::postgres()
        }
    }

    /// The snowflake dialect.
    #[must_use]
    pub fn snowflake() -> Self {
        Self {
            backend: Backend::Snowflake,
            quote: '"',
            placeholder: PlaceholderStyle::Question,
            folds_to_upper: true,
            supports_transactional_ddl: true,
            supports_column_widening: false,
            stores_json_natively: false,
            cast_placeholders: false,
            escape_backslash: true,
            named_pk_constraints: true,
            merge_flavor: MergeFlavor::MergeInto,
            rename_style: RenameStyle::AlterTable,
            type_map: snowflake_type,
            pk_type_map: no_pk_override,
        }
    }

    /// The bigquery dialect.
    #[must_use]
    pub fn bigquery() -> Self {
        Self {
            backend: Backend::Bigquery,
            quote: '`',
            placeholder: PlaceholderStyle::Question,
            folds_to_upper: false,
            supports_transactional_ddl: false,
            supports_column_widening: false,
            stores_json_natively: false,
            cast_placeholders: false,
            escape_backslash: true,
            named_pk_constraints: false,
            merge_flavor: MergeFlavor::MergeInto,
            rename_style: RenameStyle::AlterTable,
            type_map: bigquery_type,
            pk_type_map: no_pk_override,
        }
    }

    /// The clickhouse dialect.
    #[must_use]
    pub fn clickhouse() -> Self {
        Self {
            backend: Backend::Clickhouse,
            quote: '`',
            placeholder: PlaceholderStyle::Question,
            folds_to_upper: false,
            supports_transactional_ddl: false,
            supports_column_widening: true,
            stores_json_natively: false,
            cast_placeholders: false,
            escape_backslash: true,
            named_pk_constraints: false,
            merge_flavor: MergeFlavor::ReplacingEngine,
            rename_style: RenameStyle::RenameTable,
            type_map: clickhouse_type,
            pk_type_map: no_pk_override,
        }
    }

    /// The in-memory test dialect.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            merge_flavor: MergeFlavor::OnConflict,
            ..Self::postgres()
        }
    }

    /// Folds an identifier per the backend's case rules.
    #[must_use]
    pub fn fold(&self, ident: &str) -> String {
        if self.folds_to_upper {
            ident.to_uppercase()
        } else {
            ident.to_owned()
        }
    }

    /// Quotes an identifier, folding case and doubling embedded quotes.
    #[must_use]
    pub fn quote_ident(&self, ident: &str) -> String {
        let folded = self.fold(ident);
        let doubled = folded.replace(self.quote, &format!("{0}{0}", self.quote));
        format!("{0}{1}{0}", self.quote, doubled)
    }

    /// Returns the `i`-th parameter placeholder (1-based).
    #[must_use]
    pub fn placeholder(&self, i: usize) -> String {
        match self.placeholder {
            PlaceholderStyle::Dollar => format!("${i}"),
            PlaceholderStyle::Question => "?".to_owned(),
        }
    }

    /// Returns the `i`-th placeholder with an optional cast for the column.
    #[must_use]
    pub fn typecast_placeholder(&self, i: usize, column: &Column) -> String {
        let p = self.placeholder(i);
        if self.cast_placeholders && !column.sql_type.is_empty() {
            format!("{p}::{}", column.sql_type)
        } else {
            p
        }
    }

    /// Maps a canonical data type to this backend's DDL type.
    #[must_use]
    pub fn sql_type(&self, data_type: DataType) -> &'static str {
        (self.type_map)(data_type)
    }

    /// Returns the DDL fragment for one column.
    ///
    /// Primary-key columns may use a narrower type than the default mapping
    /// (mysql rejects `TEXT` in primary keys).
    #[must_use]
    pub fn column_ddl(&self, name: &str, column: &Column, table: &Table) -> String {
        let mut ddl_type = column.ddl_type().to_owned();
        if table.pk_fields.contains(name) {
            if let Some(override_type) = (self.pk_type_map)(&ddl_type) {
                ddl_type = override_type.to_owned();
            }
        }
        format!("{} {ddl_type}", self.quote_ident(name))
    }

    /// Fills in backend SQL types for columns that only carry canonical types.
    #[must_use]
    pub fn resolve_types(&self, table: &Table) -> Table {
        let mut resolved = table.clone();
        for column in resolved.columns.values_mut() {
            if column.sql_type.is_empty() {
                column.sql_type = self.sql_type(column.data_type).to_owned();
            }
        }
        resolved
    }

    /// `CREATE TABLE` for backends with standard column DDL.
    #[must_use]
    pub fn create_table_sql(&self, table: &Table) -> String {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|(name, column)| self.column_ddl(name, column, table))
            .collect();
        let mut clauses = columns;
        if !table.pk_fields.is_empty() {
            let fields: Vec<String> = table
                .pk_fields
                .iter()
                .map(|f| self.quote_ident(f))
                .collect();
            if self.named_pk_constraints && !table.pk_name.is_empty() {
                clauses.push(format!(
                    "CONSTRAINT {} PRIMARY KEY ({})",
                    self.quote_ident(&table.pk_name),
                    fields.join(", ")
                ));
            } else {
                clauses.push(format!("PRIMARY KEY ({})", fields.join(", ")));
            }
        }
        let temporary = if table.temporary { "TEMPORARY " } else { "" };
        format!(
            "CREATE {temporary}TABLE IF NOT EXISTS {} ({})",
            self.quote_ident(&table.name),
            clauses.join(", ")
        )
    }

    /// `ALTER TABLE … ADD COLUMN`, one statement per column for portability.
    #[must_use]
    pub fn add_column_sql(&self, table: &Table, name: &str, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_ident(&table.name),
            self.column_ddl(name, column, table)
        )
    }

    /// Drops the current primary-key constraint.
    #[must_use]
    pub fn drop_pk_sql(&self, table_name: &str, pk_name: &str) -> String {
        if self.named_pk_constraints {
            format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                self.quote_ident(table_name),
                self.quote_ident(pk_name)
            )
        } else {
            format!("ALTER TABLE {} DROP PRIMARY KEY", self.quote_ident(table_name))
        }
    }

    /// Creates the primary-key constraint described by `table`.
    #[must_use]
    pub fn add_pk_sql(&self, table: &Table) -> String {
        let fields: Vec<String> = table
            .pk_fields
            .iter()
            .map(|f| self.quote_ident(f))
            .collect();
        if self.named_pk_constraints && !table.pk_name.is_empty() {
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&table.name),
                self.quote_ident(&table.pk_name),
                fields.join(", ")
            )
        } else {
            format!(
                "ALTER TABLE {} ADD PRIMARY KEY ({})",
                self.quote_ident(&table.name),
                fields.join(", ")
            )
        }
    }

    /// Multi-row `INSERT` with placeholders, optionally as a native upsert.
    ///
    /// Backends with `MergeInto` or `DeleteInsert` flavors assemble their own
    /// merge statements; asking for `merge` here falls back to a plain insert
    /// for them.
    #[must_use]
    pub fn insert_sql(&self, table: &Table, columns: &[&str], rows: usize, merge: bool) -> String {
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let mut groups = Vec::with_capacity(rows);
        for row in 0..rows {
            let placeholders: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let column = table.columns.get(*name).cloned().unwrap_or_default();
                    self.typecast_placeholder(row * columns.len() + i + 1, &column)
                })
                .collect();
            groups.push(format!("({})", placeholders.join(", ")));
        }
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_ident(&table.name),
            quoted.join(", "),
            groups.join(", ")
        );
        if merge && !table.pk_fields.is_empty() {
            match self.merge_flavor {
                MergeFlavor::OnConflict => {
                    let pk: Vec<String> = table
                        .pk_fields
                        .iter()
                        .map(|f| self.quote_ident(f))
                        .collect();
                    let updates = self.update_set(table, columns, "EXCLUDED");
                    if updates.is_empty() {
                        sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", pk.join(", ")));
                    } else {
                        sql.push_str(&format!(
                            " ON CONFLICT ({}) DO UPDATE SET {}",
                            pk.join(", "),
                            updates
                        ));
                    }
                }
                MergeFlavor::OnDuplicateKey => {
                    let mut updates = self.values_update_set(table, columns);
                    if updates.is_empty() {
                        // mysql requires at least one assignment
                        let first = self.quote_ident(columns[0]);
                        updates = format!("{first} = VALUES({first})");
                    }
                    sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {updates}"));
                }
                _ => {}
            }
        }
        sql
    }

    /// `INSERT INTO target … SELECT … FROM source`, optionally as an upsert.
    ///
    /// Returns one or more statements to run in order (`DeleteInsert` needs
    /// two).
    #[must_use]
    pub fn copy_sql(
        &self,
        target: &Table,
        source_name: &str,
        columns: &[&str],
        merge: bool,
    ) -> Vec<String> {
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let target_name = self.quote_ident(&target.name);
        let source_name = self.quote_ident(source_name);
        let plain = format!(
            "INSERT INTO {target_name} ({cols}) SELECT {cols} FROM {source_name}",
            cols = quoted.join(", ")
        );
        if !merge || target.pk_fields.is_empty() {
            return vec![plain];
        }
        match self.merge_flavor {
            MergeFlavor::OnConflict => {
                let pk: Vec<String> = target
                    .pk_fields
                    .iter()
                    .map(|f| self.quote_ident(f))
                    .collect();
                let updates = self.update_set(target, columns, "EXCLUDED");
                if updates.is_empty() {
                    vec![format!("{plain} ON CONFLICT ({}) DO NOTHING", pk.join(", "))]
                } else {
                    vec![format!(
                        "{plain} ON CONFLICT ({}) DO UPDATE SET {}",
                        pk.join(", "),
                        updates
                    )]
                }
            }
            MergeFlavor::OnDuplicateKey => {
                let subquery = format!(
                    "INSERT INTO {target_name} ({cols}) SELECT * FROM (SELECT {cols} FROM {source_name}) AS {src}",
                    cols = quoted.join(", "),
                    src = self.quote_ident("S"),
                );
                let mut updates = self.aliased_update_set(target, columns, "S");
                if updates.is_empty() {
                    let first = self.quote_ident(columns[0]);
                    updates = format!("{first} = {}.{first}", self.quote_ident("S"));
                }
                vec![format!("{subquery} ON DUPLICATE KEY UPDATE {updates}")]
            }
            MergeFlavor::MergeInto => {
                vec![self.merge_into_sql(target, &source_name, columns)]
            }
            MergeFlavor::DeleteInsert => {
                let conditions: Vec<String> = target
                    .pk_fields
                    .iter()
                    .map(|f| {
                        let q = self.quote_ident(f);
                        format!("{target_name}.{q} = {source_name}.{q}")
                    })
                    .collect();
                vec![
                    format!(
                        "DELETE FROM {target_name} USING {source_name} WHERE {}",
                        conditions.join(" AND ")
                    ),
                    plain,
                ]
            }
            MergeFlavor::ReplacingEngine => vec![plain],
        }
    }

    /// `MERGE INTO` statement shared by snowflake and bigquery.
    #[must_use]
    pub fn merge_into_sql(&self, target: &Table, source_name: &str, columns: &[&str]) -> String {
        let target_name = self.quote_ident(&target.name);
        let on: Vec<String> = target
            .pk_fields
            .iter()
            .map(|f| {
                let q = self.quote_ident(f);
                format!("T.{q} = S.{q}")
            })
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !target.pk_fields.contains(**c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("T.{q} = S.{q}")
            })
            .collect();
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let values: Vec<String> = quoted.iter().map(|q| format!("S.{q}")).collect();
        let matched = if updates.is_empty() {
            String::new()
        } else {
            format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", "))
        };
        format!(
            "MERGE INTO {target_name} T USING {source_name} S ON {}{matched} WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            on.join(" AND "),
            quoted.join(", "),
            values.join(", ")
        )
    }

    /// Renders a value as a SQL literal for engines driven by rendered SQL.
    #[must_use]
    pub fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_owned(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_owned(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.string_literal(s),
            other => self.string_literal(&other.to_string()),
        }
    }

    /// Renders a string literal with backend escaping rules.
    #[must_use]
    pub fn string_literal(&self, s: &str) -> String {
        let mut escaped = s.replace('\'', "''");
        if self.escape_backslash {
            escaped = escaped.replace('\\', "\\\\");
        }
        format!("'{escaped}'")
    }

    /// Rename statement.
    #[must_use]
    pub fn rename_sql(&self, from: &str, to: &str) -> String {
        match self.rename_style {
            RenameStyle::AlterTable => format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_ident(from),
                self.quote_ident(to)
            ),
            RenameStyle::RenameTable => format!(
                "RENAME TABLE {} TO {}",
                self.quote_ident(from),
                self.quote_ident(to)
            ),
        }
    }

    /// Truncate statement; schema is preserved.
    #[must_use]
    pub fn truncate_sql(&self, table_name: &str) -> String {
        format!("TRUNCATE TABLE {}", self.quote_ident(table_name))
    }

    /// Drop statement.
    #[must_use]
    pub fn drop_sql(&self, table_name: &str, if_exists: bool) -> String {
        let clause = if if_exists { "IF EXISTS " } else { "" };
        format!("DROP TABLE {clause}{}", self.quote_ident(table_name))
    }

    fn update_set(&self, table: &Table, columns: &[&str], source_alias: &str) -> String {
        columns
            .iter()
            .filter(|c| !table.pk_fields.contains(**c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = {source_alias}.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn values_update_set(&self, table: &Table, columns: &[&str]) -> String {
        columns
            .iter()
            .filter(|c| !table.pk_fields.contains(**c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = VALUES({q})")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn aliased_update_set(&self, table: &Table, columns: &[&str], alias: &str) -> String {
        let alias = self.quote_ident(alias);
        columns
            .iter()
            .filter(|c| !table.pk_fields.contains(**c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = {alias}.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Returns the `deprecated_<name>_<yyyymmdd_hhmmss>` side-table name used
/// while swapping a table out.
#[must_use]
pub fn deprecated_table_name(name: &str) -> String {
    format!("deprecated_{name}_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Returns the `<name>_tmp_<yymmdd_hhmmss>` staging sibling used by
/// replace-table streams.
#[must_use]
pub fn staging_table_name(name: &str) -> String {
    format!("{name}_tmp_{}", Utc::now().format("%y%m%d_%H%M%S"))
}

fn no_pk_override(_: &str) -> Option<&'static str> {
    None
}

fn postgres_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Bool => "boolean",
        DataType::Timestamp => "timestamp with time zone",
        DataType::Json => "jsonb",
        DataType::String | DataType::Unknown => "text",
    }
}

fn redshift_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Bool => "boolean",
        DataType::Timestamp => "timestamp with time zone",
        DataType::Json | DataType::String | DataType::Unknown => "character varying(65535)",
    }
}

fn mysql_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "BIGINT",
        DataType::Float64 => "DOUBLE",
        DataType::Bool => "BOOLEAN",
        DataType::Timestamp => "TIMESTAMP(6)",
        DataType::Json => "JSON",
        DataType::String | DataType::Unknown => "TEXT",
    }
}

fn mysql_pk_type(ddl_type: &str) -> Option<&'static str> {
    // legacy mysql rejects TEXT in primary keys
    if ddl_type.eq_ignore_ascii_case("TEXT") {
        Some("VARCHAR(255)")
    } else {
        None
    }
}

fn snowflake_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "NUMBER(38,0)",
        DataType::Float64 => "DOUBLE PRECISION",
        DataType::Bool => "BOOLEAN",
        DataType::Timestamp => "TIMESTAMP_TZ",
        DataType::Json => "VARIANT",
        DataType::String | DataType::Unknown => "TEXT",
    }
}

fn bigquery_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "INT64",
        DataType::Float64 => "FLOAT64",
        DataType::Bool => "BOOL",
        DataType::Timestamp => "TIMESTAMP",
        DataType::Json => "JSON",
        DataType::String | DataType::Unknown => "STRING",
    }
}

fn clickhouse_type(t: DataType) -> &'static str {
    match t {
        DataType::Int64 => "Int64",
        DataType::Float64 => "Float64",
        DataType::Bool => "Bool",
        DataType::Timestamp => "DateTime64(6)",
        DataType::Json | DataType::String | DataType::Unknown => "String",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_pk() -> Table {
        let mut t = Table::new("events");
        let mut id = Column::of(DataType::Int64);
        id.sql_type = "bigint".into();
        let mut v = Column::of(DataType::String);
        v.sql_type = "text".into();
        t.columns.insert("id".into(), id);
        t.columns.insert("v".into(), v);
        t.pk_fields.insert("id".into());
        t.pk_name = "jitsu_pk_abc".into();
        t
    }

    #[test]
    fn quoting_and_folding() {
        let pg = Dialect::postgres();
        assert_eq!(pg.quote_ident("events"), "\"events\"");
        assert_eq!(pg.quote_ident("we\"ird"), "\"we\"\"ird\"");

        let sf = Dialect::snowflake();
        assert_eq!(sf.quote_ident("events"), "\"EVENTS\"");

        let my = Dialect::mysql();
        assert_eq!(my.quote_ident("events"), "`events`");
    }

    #[test]
    fn create_table_with_named_pk() {
        let sql = Dialect::postgres().create_table_sql(&table_with_pk());
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"events\" (\"id\" bigint, \"v\" text, \
             CONSTRAINT \"jitsu_pk_abc\" PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn mysql_pk_text_columns_become_varchar() {
        let my = Dialect::mysql();
        let mut t = Table::new("events");
        let mut id = Column::of(DataType::String);
        id.sql_type = "TEXT".into();
        t.columns.insert("id".into(), id);
        t.pk_fields.insert("id".into());
        let sql = my.create_table_sql(&t);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `events` (`id` VARCHAR(255), PRIMARY KEY (`id`))"
        );
    }

    #[test]
    fn insert_with_on_conflict_merge() {
        let pg = Dialect::postgres();
        let t = table_with_pk();
        let sql = pg.insert_sql(&t, &["id", "v"], 1, true);
        assert_eq!(
            sql,
            "INSERT INTO \"events\" (\"id\", \"v\") VALUES ($1::bigint, $2::text) \
             ON CONFLICT (\"id\") DO UPDATE SET \"v\" = EXCLUDED.\"v\""
        );
    }

    #[test]
    fn insert_all_pk_columns_does_nothing_on_conflict() {
        let pg = Dialect::postgres();
        let mut t = Table::new("events");
        let mut id = Column::of(DataType::Int64);
        id.sql_type = "bigint".into();
        t.columns.insert("id".into(), id);
        t.pk_fields.insert("id".into());
        let sql = pg.insert_sql(&t, &["id"], 1, true);
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn mysql_merge_uses_on_duplicate_key() {
        let my = Dialect::mysql();
        let t = table_with_pk();
        let sql = my.insert_sql(&t, &["id", "v"], 2, true);
        assert_eq!(
            sql,
            "INSERT INTO `events` (`id`, `v`) VALUES (?, ?), (?, ?) \
             ON DUPLICATE KEY UPDATE `v` = VALUES(`v`)"
        );
    }

    #[test]
    fn redshift_merge_copies_via_delete_insert() {
        let rs = Dialect::redshift();
        let t = table_with_pk();
        let statements = rs.copy_sql(&t, "staging", &["id", "v"], true);
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0],
            "DELETE FROM \"events\" USING \"staging\" WHERE \"events\".\"id\" = \"staging\".\"id\""
        );
        assert!(statements[1].starts_with("INSERT INTO \"events\""));
    }

    #[test]
    fn merge_into_statement() {
        let sf = Dialect::snowflake();
        let t = {
            let mut t = table_with_pk();
            t.name = "EVENTS".into();
            t
        };
        let sql = sf.merge_into_sql(&t, "\"STAGING\"", &["id", "v"]);
        assert_eq!(
            sql,
            "MERGE INTO \"EVENTS\" T USING \"STAGING\" S ON T.\"ID\" = S.\"ID\" \
             WHEN MATCHED THEN UPDATE SET T.\"V\" = S.\"V\" \
             WHEN NOT MATCHED THEN INSERT (\"ID\", \"V\") VALUES (S.\"ID\", S.\"V\")"
        );
    }

    #[test]
    fn literals_escape_quotes_and_backslashes() {
        let pg = Dialect::postgres();
        assert_eq!(pg.render_literal(&Value::String("o'clock".into())), "'o''clock'");
        let ch = Dialect::clickhouse();
        assert_eq!(
            ch.render_literal(&Value::String("a\\b'c".into())),
            "'a\\\\b''c'"
        );
        assert_eq!(pg.render_literal(&Value::Null), "NULL");
        assert_eq!(pg.render_literal(&serde_json::json!(3.14)), "3.14");
    }

    #[test]
    fn artifact_names_follow_conventions() {
        let staging = staging_table_name("events");
        assert!(staging.starts_with("events_tmp_"));
        let deprecated = deprecated_table_name("events");
        assert!(deprecated.starts_with("deprecated_events_"));
    }
}
