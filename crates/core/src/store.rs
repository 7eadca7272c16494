//! Contract for the data store that generated code runs against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeDialect {
    /// Declarative, read-only query.
    Query,
    /// Imperative statement that changes the stored data.
    Transform,
}

impl CodeDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Transform => "transform",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub rows_affected: u64,
}

impl TabularResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self { rows_affected, ..Self::default() }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First `limit` rows as pipe-separated text for prompts.
    pub fn preview(&self, limit: usize) -> String {
        let mut lines = vec![self.columns.join(" | ")];
        for row in self.rows.iter().take(limit) {
            let cells = row
                .iter()
                .map(|cell| match cell {
                    serde_json::Value::String(text) => text.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>();
            lines.push(cells.join(" | "));
        }
        lines.join("\n")
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("{dialect} code is not allowed here: {reason}")]
    Rejected { dialect: &'static str, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn execute(&self, code: &str, dialect: CodeDialect) -> Result<TabularResult, StoreError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::TabularResult;

    #[test]
    fn preview_limits_rows_and_flattens_cells() {
        let result = TabularResult {
            columns: vec!["Region".to_string(), "Total".to_string()],
            rows: vec![
                vec![json!("west"), json!(12.5)],
                vec![json!("east"), json!(null)],
                vec![json!("north"), json!(3)],
            ],
            rows_affected: 0,
        };
        assert_eq!(result.preview(2), "Region | Total\nwest | 12.5\neast | ");
        assert_eq!(result.row_count(), 3);
    }
}
