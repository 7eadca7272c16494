//! Grounds raw (table, column) guesses in the live schema, repairing what
//! it can and declaring ambiguity for the rest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use strsim::normalized_levenshtein;
use tabula_core::config::DialogueConfig;
use tabula_core::{
    dedupe_entities, AmbiguityDeclaration, AmbiguityLedger, AmbiguityLevel, Entity, Relation,
    SchemaCatalog, WILDCARD_COLUMN,
};

use crate::llm::{complete_within, CompletionOptions, LlmClient};
use crate::prompts;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchConfidence {
    No,
    Maybe,
    Yes,
}

impl MatchConfidence {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" => Self::Yes,
            "maybe" => Self::Maybe,
            _ => Self::No,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnCandidate {
    pub confidence: MatchConfidence,
    pub table: String,
    pub column: String,
}

/// Proposes a real column for a reference the schema does not know.
#[async_trait]
pub trait ColumnFinder: Send + Sync {
    async fn find(&self, table: &str, column: &str, catalog: &SchemaCatalog) -> Result<ColumnCandidate>;
}

pub struct LlmColumnFinder {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmColumnFinder {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl ColumnFinder for LlmColumnFinder {
    async fn find(&self, table: &str, column: &str, catalog: &SchemaCatalog) -> Result<ColumnCandidate> {
        #[derive(Deserialize)]
        struct RawCandidate {
            #[serde(rename = "match")]
            confidence: String,
            #[serde(default)]
            table: String,
            #[serde(default)]
            column: String,
        }

        let prompt = prompts::column_finder_prompt(table, column, catalog);
        let options = CompletionOptions::default().with_max_tokens(96);
        let response = complete_within(self.llm.as_ref(), &prompt, &options, self.timeout).await?;
        let object = match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if start < end => &response[start..=end],
            _ => return Err(anyhow!("column finder returned no JSON object")),
        };
        let raw: RawCandidate = serde_json::from_str(object)?;
        Ok(ColumnCandidate {
            confidence: MatchConfidence::parse(&raw.confidence),
            table: raw.table,
            column: raw.column,
        })
    }
}

enum TableMatch {
    Exact(String),
    Fuzzy(String),
}

pub struct EntityValidator {
    table_cutoff: f64,
    column_cutoff: f64,
    repair_iterations: u32,
    finder: Option<Arc<dyn ColumnFinder>>,
}

impl Default for EntityValidator {
    fn default() -> Self {
        Self::from_config(&DialogueConfig::default())
    }
}

impl EntityValidator {
    pub fn from_config(config: &DialogueConfig) -> Self {
        Self {
            table_cutoff: config.table_match_cutoff,
            column_cutoff: config.column_match_cutoff,
            repair_iterations: config.repair_iterations,
            finder: None,
        }
    }

    pub fn with_finder(mut self, finder: Arc<dyn ColumnFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    /// Resolves every entity against `catalog`.
    ///
    /// Schema-exact entities come back verified and otherwise untouched. A
    /// fuzzily matched table is kept unverified under a `confirmation`
    /// declaration; columns that survive the repair loop unresolved end up
    /// in a `partial` declaration and are dropped.
    pub async fn validate(
        &self,
        raw: Vec<Entity>,
        catalog: &SchemaCatalog,
        current_table: Option<&str>,
        ledger: &mut AmbiguityLedger,
    ) -> Vec<Entity> {
        let mut resolved = Vec::with_capacity(raw.len());
        let mut queue = Vec::new();

        for entity in raw {
            let (table, fuzzy_table) = match self.resolve_table(&entity.table, catalog, current_table) {
                Some(TableMatch::Exact(table)) => (table, false),
                Some(TableMatch::Fuzzy(table)) => (table, true),
                None => {
                    queue.push(entity);
                    continue;
                }
            };

            let Some(column) = self.resolve_column(&table, &entity.column, catalog) else {
                queue.push(Entity { table, ..entity });
                continue;
            };

            if fuzzy_table {
                tracing::debug!(
                    event_name = "entities.table.fuzzy",
                    proposed = %entity.table,
                    resolved = %table,
                );
                ledger.declare(
                    AmbiguityDeclaration::new(AmbiguityLevel::Confirmation).with_values([table.clone()]),
                );
            }
            resolved.push(Entity { table, column, verified: !fuzzy_table, ..entity });
        }

        let unresolved = self.repair(queue, catalog, ledger, &mut resolved).await;
        if !unresolved.is_empty() {
            tracing::info!(
                event_name = "entities.unresolved",
                count = unresolved.len(),
                "repair budget exhausted"
            );
            ledger.declare(
                AmbiguityDeclaration::new(AmbiguityLevel::Partial)
                    .with_values(unresolved.iter().map(|entity| entity.column.clone())),
            );
        }

        dedupe_entities(resolved)
    }

    async fn repair(
        &self,
        mut queue: Vec<Entity>,
        catalog: &SchemaCatalog,
        ledger: &mut AmbiguityLedger,
        resolved: &mut Vec<Entity>,
    ) -> Vec<Entity> {
        let Some(finder) = &self.finder else {
            return queue;
        };

        for iteration in 0..self.repair_iterations {
            if queue.is_empty() {
                break;
            }
            let mut requeue = Vec::new();
            for entity in queue {
                let candidate = match finder.find(&entity.table, &entity.column, catalog).await {
                    Ok(candidate) if catalog.is_valid(&candidate.table, &candidate.column) => candidate,
                    Ok(_) => {
                        requeue.push(entity);
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(
                            event_name = "entities.repair.failed",
                            iteration,
                            column = %entity.column,
                            error = %error,
                        );
                        requeue.push(entity);
                        continue;
                    }
                };

                match candidate.confidence {
                    MatchConfidence::Yes => {
                        resolved.push(Entity {
                            table: candidate.table,
                            column: candidate.column,
                            verified: true,
                            ..entity
                        });
                    }
                    MatchConfidence::Maybe => {
                        ledger.declare(
                            AmbiguityDeclaration::new(AmbiguityLevel::Confirmation)
                                .with_values([format!("{}.{}", candidate.table, candidate.column)]),
                        );
                        resolved.push(Entity {
                            table: candidate.table,
                            column: candidate.column,
                            verified: false,
                            relation: Some(Relation::Ambiguous),
                            ..entity
                        });
                    }
                    MatchConfidence::No => requeue.push(entity),
                }
            }
            queue = requeue;
        }
        queue
    }

    fn resolve_table(
        &self,
        table: &str,
        catalog: &SchemaCatalog,
        current_table: Option<&str>,
    ) -> Option<TableMatch> {
        let table = table.trim();
        if table.is_empty() {
            let fallback = current_table.filter(|current| catalog.has_table(current)).or_else(|| {
                let mut names = catalog.table_names();
                match (names.next(), names.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            });
            return fallback.map(|name| TableMatch::Exact(name.to_string()));
        }
        if catalog.has_table(table) {
            return Some(TableMatch::Exact(table.to_string()));
        }
        if let Some(name) = catalog.table_names().find(|name| name.eq_ignore_ascii_case(table)) {
            return Some(TableMatch::Exact(name.to_string()));
        }
        closest(table, catalog.table_names(), self.table_cutoff)
            .map(|name| TableMatch::Fuzzy(name.to_string()))
    }

    fn resolve_column(&self, table: &str, column: &str, catalog: &SchemaCatalog) -> Option<String> {
        let column = column.trim();
        if column == WILDCARD_COLUMN || catalog.column(table, column).is_some() {
            return Some(column.to_string());
        }
        let names = catalog.column_names(table);
        if let Some(name) = names.iter().find(|name| name.eq_ignore_ascii_case(column)) {
            return Some(name.to_string());
        }
        closest(column, names.into_iter(), self.column_cutoff).map(str::to_string)
    }
}

/// Highest normalised Levenshtein similarity at or above `cutoff`.
fn closest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>, cutoff: f64) -> Option<&'a str> {
    let target = target.to_lowercase();
    candidates
        .map(|candidate| (normalized_levenshtein(&target, &candidate.to_lowercase()), candidate))
        .filter(|(score, _)| *score >= cutoff)
        .max_by(|left, right| left.0.total_cmp(&right.0))
        .map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tabula_core::{AmbiguityLedger, AmbiguityLevel, Entity, Relation, SchemaCatalog};

    use super::{EntityValidator, LlmColumnFinder};
    use crate::testing::{sample_catalog, ScriptedLlm};

    #[tokio::test]
    async fn misspelled_table_is_repaired_with_confirmation() {
        let catalog = SchemaCatalog::from_columns([("orders", vec!["Total", "Date"])]);
        let mut ledger = AmbiguityLedger::new();

        let entities = EntityValidator::default()
            .validate(vec![Entity::new("ordrs", "Total")], &catalog, None, &mut ledger)
            .await;

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].table, "orders");
        assert_eq!(entities[0].column, "Total");
        assert!(!entities[0].verified);
        assert!(ledger.is_active(AmbiguityLevel::Confirmation));
        assert_eq!(
            ledger.context(AmbiguityLevel::Confirmation).map(|context| context.values.clone()),
            Some(vec!["orders".to_string()])
        );
    }

    #[tokio::test]
    async fn valid_entities_revalidate_unchanged() {
        let catalog = sample_catalog();
        let validator = EntityValidator::default();
        let input = vec![
            Entity::new("orders", "Total").verified(),
            Entity::new("returns", "*").verified(),
            Entity::new("orders", "Customer Name").verified().with_row("3"),
        ];

        let mut ledger = AmbiguityLedger::new();
        let once = validator.validate(input.clone(), &catalog, Some("orders"), &mut ledger).await;
        assert_eq!(once, input);
        assert!(!ledger.present());

        let twice = validator.validate(once.clone(), &catalog, Some("orders"), &mut ledger).await;
        assert_eq!(twice, once);
        assert!(!ledger.present());

        let unverified = vec![Entity::new("orders", "Total"), Entity::new("returns", "Reason")];
        let verified = validator.validate(unverified, &catalog, Some("orders"), &mut ledger).await;
        assert_eq!(
            verified,
            vec![Entity::new("orders", "Total").verified(), Entity::new("returns", "Reason").verified()]
        );
        assert!(!ledger.present());
        let again = validator.validate(verified.clone(), &catalog, Some("orders"), &mut ledger).await;
        assert_eq!(again, verified);
    }

    #[tokio::test]
    async fn columns_resolve_by_case_and_similarity() {
        let catalog = sample_catalog();
        let mut ledger = AmbiguityLedger::new();
        let entities = EntityValidator::default()
            .validate(
                vec![
                    Entity::new("", "total"),
                    Entity::new("orders", "Regon"),
                    Entity::new("orders", "Total"),
                ],
                &catalog,
                Some("orders"),
                &mut ledger,
            )
            .await;

        assert_eq!(
            entities,
            vec![Entity::new("orders", "Total").verified(), Entity::new("orders", "Region").verified()]
        );
        assert!(!ledger.present());
    }

    #[tokio::test]
    async fn repair_loop_accepts_strong_and_flags_weak_matches() {
        let catalog = sample_catalog();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"match": "yes", "table": "orders", "column": "Total"}"#,
            r#"{"match": "maybe", "table": "returns", "column": "Reason"}"#,
        ]));
        let validator = EntityValidator::default()
            .with_finder(Arc::new(LlmColumnFinder::new(llm, Duration::from_secs(1))));
        let mut ledger = AmbiguityLedger::new();

        let entities = validator
            .validate(
                vec![Entity::new("orders", "revenue"), Entity::new("returns", "why")],
                &catalog,
                None,
                &mut ledger,
            )
            .await;

        assert_eq!(entities[0], Entity::new("orders", "Total").verified());
        assert_eq!(entities[1], Entity::new("returns", "Reason").with_relation(Relation::Ambiguous));
        assert!(ledger.is_active(AmbiguityLevel::Confirmation));
        assert!(!ledger.is_active(AmbiguityLevel::Partial));
    }

    #[tokio::test]
    async fn exhausted_repair_declares_partial() {
        let catalog = sample_catalog();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"match": "no", "table": "", "column": ""}"#,
            r#"{"match": "yes", "table": "orders", "column": "Missing"}"#,
            "no idea",
        ]));
        let validator = EntityValidator::default()
            .with_finder(Arc::new(LlmColumnFinder::new(llm.clone(), Duration::from_secs(1))));
        let mut ledger = AmbiguityLedger::new();

        let entities = validator
            .validate(vec![Entity::new("orders", "margin")], &catalog, None, &mut ledger)
            .await;

        assert!(entities.is_empty());
        assert_eq!(llm.prompts().len(), 3);
        assert_eq!(
            ledger.context(AmbiguityLevel::Partial).map(|context| context.values.clone()),
            Some(vec!["margin".to_string()])
        );
    }
}
