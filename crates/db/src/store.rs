//! SQLite-backed [`DataStore`].

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tabula_core::{CodeDialect, DataStore, StoreError, TabularResult};

use crate::DbPool;

const READ_ONLY_KEYWORDS: [&str; 4] = ["SELECT", "WITH", "VALUES", "EXPLAIN"];

pub struct SqliteDataStore {
    pool: DbPool,
}

impl SqliteDataStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn query(&self, code: &str) -> Result<TabularResult, StoreError> {
        if !is_read_only(code) {
            return Err(StoreError::Rejected {
                dialect: CodeDialect::Query.as_str(),
                reason: "only SELECT statements may run as a query".to_string(),
            });
        }
        let rows = sqlx::query(code).fetch_all(&self.pool).await.map_err(store_error)?;
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|column| column.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(TabularResult { columns, rows, rows_affected: 0 })
    }

    async fn transform(&self, code: &str) -> Result<TabularResult, StoreError> {
        if is_read_only(code) {
            return Err(StoreError::Rejected {
                dialect: CodeDialect::Transform.as_str(),
                reason: "a transform must change the data".to_string(),
            });
        }
        let done = sqlx::raw_sql(code).execute(&self.pool).await.map_err(store_error)?;
        Ok(TabularResult::affected(done.rows_affected()))
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn execute(&self, code: &str, dialect: CodeDialect) -> Result<TabularResult, StoreError> {
        let result = match dialect {
            CodeDialect::Query => self.query(code).await,
            CodeDialect::Transform => self.transform(code).await,
        };
        match &result {
            Ok(result) => tracing::debug!(
                event_name = "db.store.executed",
                dialect = dialect.as_str(),
                rows = result.row_count(),
                rows_affected = result.rows_affected,
            ),
            Err(error) => tracing::debug!(
                event_name = "db.store.failed",
                dialect = dialect.as_str(),
                error = %error,
            ),
        }
        result
    }
}

/// Pool exhaustion and I/O problems are transient; everything else is a
/// problem with the code itself.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(database) => StoreError::Execution(database.message().to_string()),
        other => StoreError::Execution(other.to_string()),
    }
}

fn is_read_only(code: &str) -> bool {
    let first = code
        .trim_start()
        .split(|character: char| character.is_whitespace() || character == '(')
        .next()
        .unwrap_or_default();
    READ_ONLY_KEYWORDS.iter().any(|keyword| first.eq_ignore_ascii_case(keyword))
}

/// Cells are decoded by the storage class of the value itself, since SQLite
/// columns are loosely typed.
fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, StoreError> {
    (0..row.len())
        .map(|index| {
            let raw = row.try_get_raw(index).map_err(store_error)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let type_name = raw.type_info().name().to_ascii_uppercase();
            let value = match type_name.as_str() {
                "INTEGER" | "INT8" | "BIGINT" => Value::from(row.try_get::<i64, _>(index).map_err(store_error)?),
                "BOOLEAN" => Value::from(row.try_get::<bool, _>(index).map_err(store_error)?),
                "REAL" | "NUMERIC" => Value::from(row.try_get::<f64, _>(index).map_err(store_error)?),
                "BLOB" => {
                    let bytes = row.try_get::<Vec<u8>, _>(index).map_err(store_error)?;
                    Value::from(format!("<{} bytes>", bytes.len()))
                }
                _ => Value::from(row.try_get::<String, _>(index).map_err(store_error)?),
            };
            Ok(value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tabula_core::{CodeDialect, DataStore, StoreError};

    use super::SqliteDataStore;
    use crate::connect_with_settings;

    async fn store() -> SqliteDataStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        sqlx::raw_sql(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, Total REAL, Region TEXT);
             INSERT INTO orders (Total, Region) VALUES (12.5, 'West'), (30, 'East'), (7.25, NULL);",
        )
        .execute(&pool)
        .await
        .expect("seed orders");
        SqliteDataStore::new(pool)
    }

    #[tokio::test]
    async fn query_returns_json_cells() {
        let store = store().await;

        let result = store
            .execute("SELECT id, Total, Region FROM orders ORDER BY id", CodeDialect::Query)
            .await
            .expect("query runs");

        assert_eq!(result.columns, vec!["id", "Total", "Region"]);
        assert_eq!(result.rows[0], vec![json!(1), json!(12.5), json!("West")]);
        assert_eq!(result.rows[2][2], serde_json::Value::Null);
        assert_eq!(result.row_count(), 3);
    }

    #[tokio::test]
    async fn transform_reports_rows_affected() {
        let store = store().await;

        let result = store
            .execute("UPDATE orders SET Region = 'Unknown' WHERE Region IS NULL", CodeDialect::Transform)
            .await
            .expect("update runs");
        assert_eq!(result.rows_affected, 1);
        assert!(result.columns.is_empty());

        let check = store
            .execute("SELECT COUNT(*) AS n FROM orders WHERE Region = 'Unknown'", CodeDialect::Query)
            .await
            .expect("count runs");
        assert_eq!(check.rows, vec![vec![json!(1)]]);
    }

    #[tokio::test]
    async fn dialect_mismatch_is_rejected_before_running() {
        let store = store().await;

        let error = store
            .execute("DELETE FROM orders", CodeDialect::Query)
            .await
            .expect_err("mutation through the query dialect");
        assert!(matches!(error, StoreError::Rejected { dialect: "query", .. }));

        let count = store
            .execute("SELECT COUNT(*) FROM orders", CodeDialect::Query)
            .await
            .expect("count runs");
        assert_eq!(count.rows, vec![vec![json!(3)]]);

        let error = store
            .execute("SELECT * FROM orders", CodeDialect::Transform)
            .await
            .expect_err("query through the transform dialect");
        assert!(matches!(error, StoreError::Rejected { dialect: "transform", .. }));
    }

    #[tokio::test]
    async fn bad_code_surfaces_the_database_message() {
        let store = store().await;

        let error = store
            .execute("SELECT Totl FROM orders", CodeDialect::Query)
            .await
            .expect_err("unknown column");
        assert_eq!(error, StoreError::Execution("no such column: Totl".to_string()));
    }
}
