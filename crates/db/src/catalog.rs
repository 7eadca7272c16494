//! Builds the schema catalog from SQLite's own metadata.

use sqlx::Row;
use tabula_core::{ColumnSchema, SchemaCatalog, StoreError};

use crate::store::store_error;
use crate::DbPool;

/// Reads every user table and its columns in declaration order.
pub async fn load_catalog(pool: &DbPool) -> Result<SchemaCatalog, StoreError> {
    let tables = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(store_error)?;

    let mut catalog = SchemaCatalog::new();
    for row in tables {
        let table: String = row.try_get("name").map_err(store_error)?;
        let columns = sqlx::query("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
            .bind(&table)
            .fetch_all(pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(|column| {
                let name: String = column.try_get("name")?;
                let declared: String = column.try_get("type")?;
                Ok(column_schema(name, &declared))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(store_error)?;
        catalog.insert_table(table, columns);
    }

    tracing::debug!(
        event_name = "db.catalog.loaded",
        tables = catalog.table_names().count(),
        "schema catalog loaded"
    );
    Ok(catalog)
}

/// Maps a declared SQLite type onto the engine's coarse column types,
/// keeping the declaration as the subtype.
fn column_schema(name: String, declared: &str) -> ColumnSchema {
    let upper = declared.to_ascii_uppercase();
    let col_type = if upper.is_empty() {
        "unknown"
    } else if upper.contains("DATE") || upper.contains("TIME") {
        "datetime"
    } else if upper.contains("INT")
        || ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"].iter().any(|marker| upper.contains(marker))
    {
        "number"
    } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
        "text"
    } else if upper.contains("BOOL") {
        "boolean"
    } else if upper.contains("BLOB") {
        "blob"
    } else {
        "unknown"
    };

    let column = ColumnSchema::new(name, col_type);
    if declared.is_empty() {
        column
    } else {
        column.with_subtype(declared.to_ascii_lowercase())
    }
}
