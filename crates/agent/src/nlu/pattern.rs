//! Keyword and slash-command rules over the latest user utterance.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tabula_core::{ActCode, CodeDialect, Entity, FlowType, SchemaCatalog, WILDCARD_COLUMN};

use super::{ActPredictor, Prediction, PredictionSource, UnderstandingContext};

const SLASH_CONFIDENCE: f64 = 1.0;

enum SlotFill {
    Nothing,
    Capture { slot: &'static str, regex: Regex },
    Utterance { slot: &'static str },
}

struct KeywordRule {
    name: &'static str,
    act: ActCode,
    confidence: f64,
    regex: Regex,
    fill: SlotFill,
}

pub struct PatternMatcher {
    slash: Option<Regex>,
    rules: Vec<KeywordRule>,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    pub fn new() -> Self {
        let specs: [(&str, ActCode, f64, &str); 7] = [
            (
                "confirm",
                ActCode::CONFIRM,
                0.95,
                r"(?i)^\s*(yes|yep|yeah|sure|correct|ok|okay|confirm(ed)?|that'?s right)\s*[.!]*\s*$",
            ),
            ("deny", ActCode::DENY, 0.95, r"(?i)^\s*(no|nope|nah|wrong|not that)\s*[.!]*\s*$"),
            (
                "greeting",
                ActCode::CHAT,
                0.95,
                r"(?i)^\s*(hi|hello|hey|thanks|thank you|cheers|good (morning|afternoon|evening))\b",
            ),
            (
                "dedupe",
                FlowType::Dedupe.canonical_act(),
                0.92,
                r"(?i)\b(dedupe|de-?duplicate|duplicates?|duplicated)\b",
            ),
            (
                "plot",
                FlowType::Plot.canonical_act(),
                0.8,
                r"(?i)\b(plot|chart|graph|visuali[sz]e|histogram)\b",
            ),
            ("merge", FlowType::MergeTables.canonical_act(), 0.7, r"(?i)\b(merge|join|combine)\b"),
            (
                "query",
                ActCode::QUERY,
                0.5,
                r"(?i)(\b(what|which|how many|how much|show|list|count|average|total|sum|top|find)\b|\?\s*$)",
            ),
        ];

        let rules = specs
            .into_iter()
            .filter_map(|(name, act, confidence, pattern)| {
                let regex = compile(name, pattern)?;
                let fill = match name {
                    "dedupe" => capture("strategy", r"(?i)\bkeep (?:the )?(first|last|newest|oldest)\b"),
                    "plot" => capture("chart", r"(?i)\b(bar|line|pie|scatter|area|histogram)\b"),
                    "query" => SlotFill::Utterance { slot: "operation" },
                    _ => SlotFill::Nothing,
                };
                Some(KeywordRule { name, act, confidence, regex, fill })
            })
            .collect();

        Self { slash: compile("slash", r"(?s)^\s*/(sql|transform|act)\b\s*(.*)$"), rules }
    }

    /// Classifies one utterance. Entities named in the text are attached
    /// unverified.
    pub fn match_text(
        &self,
        text: &str,
        catalog: &SchemaCatalog,
        current_table: Option<&str>,
    ) -> Prediction {
        if let Some(prediction) = self.match_slash(text) {
            return prediction;
        }

        let entities = mentioned_entities(text, catalog, current_table);
        let Some(rule) = self.rules.iter().find(|rule| rule.regex.is_match(text)) else {
            return Prediction::new(ActCode::CHAT, 0.0, PredictionSource::Pattern)
                .with_entities(entities);
        };

        tracing::trace!(event_name = "nlu.pattern.matched", rule = rule.name, act = %rule.act);
        let mut prediction = Prediction::new(rule.act, rule.confidence, PredictionSource::Pattern)
            .with_entities(entities);
        match &rule.fill {
            SlotFill::Nothing => {}
            SlotFill::Capture { slot, regex } => {
                if let Some(value) = regex.captures(text).and_then(|captures| captures.get(1)) {
                    prediction = prediction.with_slot(*slot, value.as_str().to_lowercase().into());
                }
            }
            SlotFill::Utterance { slot } => {
                prediction = prediction.with_slot(*slot, text.trim().into());
            }
        }
        prediction
    }

    fn match_slash(&self, text: &str) -> Option<Prediction> {
        let captures = self.slash.as_ref()?.captures(text)?;
        let command = captures.get(1)?.as_str();
        let argument = captures.get(2).map(|value| value.as_str().trim()).unwrap_or_default();

        let prediction = match command {
            "sql" => Prediction::new(ActCode::QUERY, SLASH_CONFIDENCE, PredictionSource::Pattern)
                .with_payload(CodeDialect::Query, argument),
            "transform" => Prediction::new(
                FlowType::UpdateRows.canonical_act(),
                SLASH_CONFIDENCE,
                PredictionSource::Pattern,
            )
            .with_payload(CodeDialect::Transform, argument),
            _ => {
                let act = ActCode::new(argument)
                    .or_else(|_| ActCode::from_phrase(argument))
                    .unwrap_or(ActCode::UNSUPPORTED);
                Prediction::new(act, SLASH_CONFIDENCE, PredictionSource::Pattern)
            }
        };
        Some(prediction)
    }
}

fn compile(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(error) => {
            tracing::warn!(event_name = "nlu.pattern.invalid", rule = name, %error, "skipping rule");
            None
        }
    }
}

fn capture(slot: &'static str, pattern: &str) -> SlotFill {
    match compile(slot, pattern) {
        Some(regex) => SlotFill::Capture { slot, regex },
        None => SlotFill::Nothing,
    }
}

#[async_trait]
impl ActPredictor for PatternMatcher {
    fn name(&self) -> &'static str {
        PredictionSource::Pattern.as_str()
    }

    async fn predict(&self, context: &UnderstandingContext<'_>) -> Result<Prediction> {
        Ok(self.match_text(context.last_user_text(), context.catalog, context.current_table))
    }
}

/// Tables and columns named in `text`. A column present in several tables
/// is attributed to a table also named in the text, else to the current
/// table. A table named without any of its columns yields `table.*`.
pub fn mentioned_entities(
    text: &str,
    catalog: &SchemaCatalog,
    current_table: Option<&str>,
) -> Vec<Entity> {
    let lowered = text.to_lowercase();
    let mentions = |name: &str| contains_word(&lowered, &name.to_lowercase());
    let named_tables = catalog.table_names().filter(|table| mentions(*table)).collect::<Vec<_>>();

    let mut entities = Vec::new();
    for table in catalog.table_names() {
        for column in catalog.column_names(table) {
            if !mentions(column) {
                continue;
            }
            let owners = catalog.tables_with_column(column);
            let preferred = owners
                .iter()
                .find(|owner| named_tables.contains(owner))
                .or_else(|| owners.iter().find(|owner| Some(**owner) == current_table))
                .copied();
            if preferred.map_or(true, |preferred| preferred == table) {
                entities.push(Entity::new(table, column));
            }
        }
    }
    for table in named_tables {
        if !entities.iter().any(|entity| entity.table == table) {
            entities.push(Entity::new(table, WILDCARD_COLUMN));
        }
    }
    entities
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |character: char| character.is_alphanumeric() || character == '_';
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}
