use serde::{Deserialize, Serialize};

use crate::schema::WILDCARD_COLUMN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Ambiguous,
    Primary,
    Foreign,
    Derived,
}

/// A (table, column) reference, optionally row-scoped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
}

impl Entity {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self { table: table.into(), column: column.into(), row: None, verified: false, relation: None }
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    pub fn with_row(mut self, row: impl Into<String>) -> Self {
        self.row = Some(row.into());
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn key(&self) -> (&str, &str) {
        (self.table.as_str(), self.column.as_str())
    }

    pub fn is_whole_table(&self) -> bool {
        self.column == WILDCARD_COLUMN
    }

    pub fn same_target(&self, other: &Entity) -> bool {
        self.key() == other.key()
    }
}

/// Keeps the first occurrence of every (table, column) pair.
pub fn dedupe_entities(entities: Vec<Entity>) -> Vec<Entity> {
    let mut unique: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities {
        if !unique.iter().any(|existing| existing.same_target(&entity)) {
            unique.push(entity);
        }
    }
    unique
}
