//! Read-only catalog of the tables and columns the engine may reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Column reference meaning "the whole table".
pub const WILDCARD_COLUMN: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub col_type: String,
    pub subtype: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, col_type: impl Into<String>) -> Self {
        Self { name: name.into(), col_type: col_type.into(), subtype: None }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, Vec<ColumnSchema>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for untyped columns.
    pub fn from_columns<T, C, S>(tables: T) -> Self
    where
        T: IntoIterator<Item = (S, C)>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self::new();
        for (table, columns) in tables {
            catalog.insert_table(
                table,
                columns.into_iter().map(|name| ColumnSchema::new(name, "unknown")).collect(),
            );
        }
        catalog
    }

    pub fn insert_table(&mut self, table: impl Into<String>, columns: Vec<ColumnSchema>) {
        self.tables.insert(table.into(), columns);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnSchema]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn column_names(&self, table: &str) -> Vec<&str> {
        self.columns(table)
            .map(|columns| columns.iter().map(|column| column.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSchema> {
        self.columns(table)?.iter().find(|candidate| candidate.name == column)
    }

    /// True when `column` exists in `table` or is the wildcard.
    pub fn is_valid(&self, table: &str, column: &str) -> bool {
        self.has_table(table) && (column == WILDCARD_COLUMN || self.column(table, column).is_some())
    }

    /// Tables that contain a column with exactly this name.
    pub fn tables_with_column(&self, column: &str) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|(_, columns)| columns.iter().any(|candidate| candidate.name == column))
            .map(|(table, _)| table.as_str())
            .collect()
    }

    /// One line per table, used for prompt context.
    pub fn describe(&self) -> String {
        self.tables
            .iter()
            .map(|(table, columns)| {
                let names = columns.iter().map(|column| column.name.as_str()).collect::<Vec<_>>();
                format!("{table}: {}", names.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnSchema, SchemaCatalog, WILDCARD_COLUMN};

    fn catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new();
        catalog.insert_table(
            "orders",
            vec![
                ColumnSchema::new("Total", "number").with_subtype("currency"),
                ColumnSchema::new("Date", "datetime"),
            ],
        );
        catalog.insert_table("customers", vec![ColumnSchema::new("Name", "text")]);
        catalog
    }

    #[test]
    fn validates_columns_and_wildcard() {
        let catalog = catalog();
        assert!(catalog.is_valid("orders", "Total"));
        assert!(catalog.is_valid("orders", WILDCARD_COLUMN));
        assert!(!catalog.is_valid("orders", "total"));
        assert!(!catalog.is_valid("ordrs", "Total"));
    }

    #[test]
    fn column_metadata_is_preserved() {
        let catalog = catalog();
        let total = catalog.column("orders", "Total").expect("column exists");
        assert_eq!(total.subtype.as_deref(), Some("currency"));
        assert_eq!(catalog.column_names("orders"), vec!["Total", "Date"]);
        assert_eq!(catalog.tables_with_column("Name"), vec!["customers"]);
    }

    #[test]
    fn describe_lists_tables_in_order() {
        let catalog = SchemaCatalog::from_columns([("b", vec!["y"]), ("a", vec!["x", "z"])]);
        assert_eq!(catalog.describe(), "a: x, z\nb: y");
    }
}
