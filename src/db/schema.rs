//! Schema snapshot types.
//!
//! Represents the structure a driver introspects from its database:
//! tables, columns, keys, indexes, and size estimates, plus a cheap
//! per-table checksum for drift detection.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::models::SelectedTables;

/// A column in an introspected table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// An index on a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

/// A foreign key relationship.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
}

/// One table (or collection) in a schema snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexSchema>,
    pub foreign_keys: Vec<ForeignKeySchema>,
    /// Estimated row count, when the engine exposes one cheaply.
    pub row_count: u64,
    /// Estimated on-disk size in bytes.
    pub size_bytes: u64,
}

impl TableSchema {
    /// Computes the drift-detection checksum for this table.
    ///
    /// Hashes the ordered column definitions and the row-count bucket,
    /// so small row churn does not invalidate caches but column changes
    /// and order-of-magnitude growth do.
    pub fn checksum(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.columns.len().hash(&mut hasher);
        for col in &self.columns {
            col.name.hash(&mut hasher);
            col.data_type.hash(&mut hasher);
            col.is_nullable.hash(&mut hasher);
            col.default.hash(&mut hasher);
        }
        self.primary_key.hash(&mut hasher);
        row_count_bucket(self.row_count).hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Buckets a row count to its order of magnitude.
pub fn row_count_bucket(count: u64) -> u64 {
    let mut bucket = 1u64;
    while bucket.saturating_mul(10) <= count {
        bucket = bucket.saturating_mul(10);
    }
    if count == 0 {
        0
    } else {
        bucket
    }
}

/// A complete per-connection schema snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Tables keyed by name; ordered for stable prompt rendering.
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaInfo {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a table, dropping internal underscore-prefixed columns.
    pub fn insert_table(&mut self, mut table: TableSchema) {
        table.columns.retain(|c| !c.name.starts_with('_'));
        self.tables.insert(table.name.clone(), table);
    }

    /// Restricts the snapshot to the selected tables. `ALL` keeps
    /// everything.
    pub fn filtered(&self, selected: &SelectedTables) -> Self {
        match selected {
            SelectedTables::All => self.clone(),
            SelectedTables::Listed(_) => Self {
                tables: self
                    .tables
                    .iter()
                    .filter(|(name, _)| selected.includes(name))
                    .map(|(name, table)| (name.clone(), table.clone()))
                    .collect(),
            },
        }
    }

    /// Per-table checksums for drift comparison.
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.tables
            .iter()
            .map(|(name, table)| (name.clone(), table.checksum()))
            .collect()
    }

    /// Formats the snapshot for inclusion in an LLM system prompt.
    pub fn format_for_llm(&self) -> String {
        let tables_text = self
            .tables
            .values()
            .map(|table| self.format_table_for_llm(table))
            .collect::<Vec<_>>()
            .join("");

        format!("Database Schema:\n\n{tables_text}")
    }

    fn format_table_for_llm(&self, table: &TableSchema) -> String {
        let column_lines = table
            .columns
            .iter()
            .map(|column| Self::format_column_line(table, column))
            .collect::<Vec<_>>()
            .join("");

        let fk_lines = if table.foreign_keys.is_empty() {
            String::new()
        } else {
            table
                .foreign_keys
                .iter()
                .map(|fk| {
                    format!(
                        "  FK: {} -> {}.{}\n",
                        fk.from_columns.join(", "),
                        fk.to_table,
                        fk.to_columns.join(", ")
                    )
                })
                .collect::<Vec<_>>()
                .join("")
        };

        format!(
            "Table: {} (~{} rows)\n{}{}\n",
            table.name, table.row_count, column_lines, fk_lines
        )
    }

    fn format_column_line(table: &TableSchema, column: &ColumnSchema) -> String {
        let annotations = [
            table
                .primary_key
                .contains(&column.name)
                .then_some("PK"),
            (!column.is_nullable).then_some("NOT NULL"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        if annotations.is_empty() {
            format!("  - {}: {}\n", column.name, column.data_type)
        } else {
            format!(
                "  - {}: {} ({})\n",
                column.name,
                column.data_type,
                annotations.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> TableSchema {
        TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    data_type: "integer".into(),
                    is_nullable: false,
                    default: None,
                },
                ColumnSchema {
                    name: "name".into(),
                    data_type: "text".into(),
                    is_nullable: true,
                    default: None,
                },
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: 1234,
            size_bytes: 65536,
        }
    }

    #[test]
    fn test_row_count_bucket() {
        assert_eq!(row_count_bucket(0), 0);
        assert_eq!(row_count_bucket(1), 1);
        assert_eq!(row_count_bucket(9), 1);
        assert_eq!(row_count_bucket(10), 10);
        assert_eq!(row_count_bucket(1234), 1000);
        assert_eq!(row_count_bucket(999_999), 100_000);
    }

    #[test]
    fn test_checksum_stable_under_row_churn() {
        let table = users_table();
        let mut churned = table.clone();
        churned.row_count = 2345; // same bucket as 1234
        assert_eq!(table.checksum(), churned.checksum());

        let mut grown = table.clone();
        grown.row_count = 123_456; // different bucket
        assert_ne!(table.checksum(), grown.checksum());
    }

    #[test]
    fn test_checksum_changes_on_column_change() {
        let table = users_table();
        let mut altered = table.clone();
        altered.columns[1].data_type = "varchar(64)".into();
        assert_ne!(table.checksum(), altered.checksum());
    }

    #[test]
    fn test_internal_columns_hidden() {
        let mut schema = SchemaInfo::new();
        let mut table = users_table();
        table.columns.push(ColumnSchema {
            name: "_created_at".into(),
            data_type: "timestamptz".into(),
            is_nullable: false,
            default: None,
        });
        schema.insert_table(table);

        let stored = &schema.tables["users"];
        assert!(stored.columns.iter().all(|c| !c.name.starts_with('_')));
        assert!(!schema.format_for_llm().contains("_created_at"));
    }

    #[test]
    fn test_filtered_by_selected_tables() {
        let mut schema = SchemaInfo::new();
        schema.insert_table(users_table());
        let mut orders = users_table();
        orders.name = "orders".into();
        schema.insert_table(orders);

        let filtered = schema.filtered(&SelectedTables::parse("users"));
        assert_eq!(filtered.tables.len(), 1);
        assert!(filtered.tables.contains_key("users"));

        let all = schema.filtered(&SelectedTables::All);
        assert_eq!(all.tables.len(), 2);
    }

    #[test]
    fn test_format_for_llm_annotations() {
        let mut schema = SchemaInfo::new();
        schema.insert_table(users_table());
        let rendered = schema.format_for_llm();
        assert!(rendered.contains("Table: users"));
        assert!(rendered.contains("id: integer (PK, NOT NULL)"));
        assert!(rendered.contains("name: text"));
    }
}
