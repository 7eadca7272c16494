//! Data-quality issue detection contract. Detectors themselves live outside
//! the dialogue engine; the tracker only decides whether to interject.

use serde::{Deserialize, Serialize};

use crate::schema::SchemaCatalog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    Outlier,
    Typo,
    Duplicate,
    Mismatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataIssue {
    pub table: String,
    pub column: String,
    pub kind: IssueKind,
    pub rows: usize,
    /// Share of the column affected, in `[0, 1]`.
    pub severity: f64,
}

pub trait IssueDetector: Send + Sync {
    fn detect(&self, table: &str, catalog: &SchemaCatalog) -> Vec<DataIssue>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoIssues;

impl IssueDetector for NoIssues {
    fn detect(&self, _table: &str, _catalog: &SchemaCatalog) -> Vec<DataIssue> {
        Vec::new()
    }
}
