//! Ambiguity ledger and clarification protocol.
//!
//! A turn may leave the agent unsure at four levels, ranked by severity:
//! `general` (no idea what is meant), `partial` (the task is known but a
//! reference could not be grounded), `specific` (a named slot is still
//! empty) and `confirmation` (a guess was made and should be confirmed).
//! The most severe active level is the one asked about.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::Relation;
use crate::flows::{Flow, FlowStack, FlowType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    General,
    Partial,
    Specific,
    Confirmation,
}

/// Most severe first.
const SEVERITY_ORDER: [AmbiguityLevel; 4] = [
    AmbiguityLevel::General,
    AmbiguityLevel::Partial,
    AmbiguityLevel::Specific,
    AmbiguityLevel::Confirmation,
];

impl AmbiguityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Partial => "partial",
            Self::Specific => "specific",
            Self::Confirmation => "confirmation",
        }
    }

    /// General and partial ambiguity mean the turn's grounding cannot be
    /// trusted.
    pub fn is_deep(self) -> bool {
        matches!(self, Self::General | Self::Partial)
    }
}

impl fmt::Display for AmbiguityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supporting context recorded with a declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityContext {
    /// Flow the uncertainty belongs to, if any.
    pub flow: Option<FlowType>,
    /// Slot that could not be filled or grounded.
    pub slot: Option<String>,
    /// Candidate values to offer back to the user.
    pub values: Vec<String>,
}

/// One call to [`AmbiguityLedger::declare`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmbiguityDeclaration {
    pub level: AmbiguityLevel,
    pub flow: Option<FlowType>,
    pub slot: Option<String>,
    pub values: Vec<String>,
    /// Ask the model backend to word the question instead of a template.
    pub generate: bool,
}

impl AmbiguityDeclaration {
    pub fn new(level: AmbiguityLevel) -> Self {
        Self { level, flow: None, slot: None, values: Vec::new(), generate: false }
    }

    pub fn for_flow(mut self, flow: FlowType) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn for_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn generated(mut self) -> Self {
        self.generate = true;
        self
    }
}

/// Everything a model-backed clarifier needs to word a question.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub level: AmbiguityLevel,
    pub flow: Option<FlowType>,
    pub goal: String,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    pub slot: Option<String>,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Clarification {
    /// Explicit observation set earlier in the turn; shown verbatim.
    Observation { text: String },
    Templated { level: AmbiguityLevel, text: String },
    Generate(ClarificationRequest),
}

/// Question wording keyed by the active flow and ambiguity level.
pub trait ClarificationTemplates: Send + Sync {
    fn render(&self, flow: Option<&Flow>, level: AmbiguityLevel, context: &AmbiguityContext)
        -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTemplates;

impl ClarificationTemplates for DefaultTemplates {
    fn render(
        &self,
        flow: Option<&Flow>,
        level: AmbiguityLevel,
        context: &AmbiguityContext,
    ) -> String {
        let options = context.values.join(", ");
        match (flow.map(|flow| flow.flow_type), level) {
            (_, AmbiguityLevel::General) => {
                "I'm not sure what you would like to do. Could you rephrase the request?".to_string()
            }
            (Some(FlowType::MergeTables), AmbiguityLevel::Specific) => {
                "Which two tables should be merged, and how should the rows be combined?".to_string()
            }
            (Some(FlowType::Measure), AmbiguityLevel::Specific) => {
                "How should the metric be calculated from the columns?".to_string()
            }
            (Some(FlowType::Plot), AmbiguityLevel::Specific) => {
                "What kind of chart would you like to see?".to_string()
            }
            (_, AmbiguityLevel::Partial) if !options.is_empty() => {
                format!("I couldn't find {options} in the data. Which columns did you mean?")
            }
            (_, AmbiguityLevel::Partial) => {
                "I couldn't tell which columns you meant. Could you name them?".to_string()
            }
            (_, AmbiguityLevel::Specific) => match (&context.slot, flow) {
                (Some(slot), Some(flow)) => {
                    format!("To {}, I still need the {slot}. What should it be?", flow.goal())
                }
                (Some(slot), None) => format!("What should the {slot} be?"),
                (None, _) => "Could you give me a bit more detail?".to_string(),
            },
            (_, AmbiguityLevel::Confirmation) if !options.is_empty() => {
                format!("Just to confirm, did you mean {options}?")
            }
            (_, AmbiguityLevel::Confirmation) => "Should I go ahead?".to_string(),
        }
    }
}

/// Per-turn uncertainty ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityLedger {
    general: bool,
    partial: bool,
    specific: bool,
    confirmation: bool,
    unknown: BTreeMap<AmbiguityLevel, AmbiguityContext>,
    observation: Option<String>,
    needs_generation: bool,
}

impl AmbiguityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag_mut(&mut self, level: AmbiguityLevel) -> &mut bool {
        match level {
            AmbiguityLevel::General => &mut self.general,
            AmbiguityLevel::Partial => &mut self.partial,
            AmbiguityLevel::Specific => &mut self.specific,
            AmbiguityLevel::Confirmation => &mut self.confirmation,
        }
    }

    pub fn is_active(&self, level: AmbiguityLevel) -> bool {
        match level {
            AmbiguityLevel::General => self.general,
            AmbiguityLevel::Partial => self.partial,
            AmbiguityLevel::Specific => self.specific,
            AmbiguityLevel::Confirmation => self.confirmation,
        }
    }

    pub fn declare(&mut self, declaration: AmbiguityDeclaration) {
        *self.flag_mut(declaration.level) = true;
        self.needs_generation |= declaration.generate;
        let context = self.unknown.entry(declaration.level).or_default();
        if declaration.flow.is_some() {
            context.flow = declaration.flow;
        }
        if declaration.slot.is_some() {
            context.slot = declaration.slot;
        }
        for value in declaration.values {
            if !context.values.contains(&value) {
                context.values.push(value);
            }
        }
    }

    /// Clears one level, or every level and the observation when `None`.
    pub fn resolve(&mut self, level: Option<AmbiguityLevel>) {
        match level {
            Some(level) => {
                *self.flag_mut(level) = false;
                self.unknown.remove(&level);
                if !self.present() {
                    self.needs_generation = false;
                }
            }
            None => *self = Self::default(),
        }
    }

    pub fn present(&self) -> bool {
        SEVERITY_ORDER.iter().any(|level| self.is_active(*level))
    }

    pub fn is_deep(&self) -> bool {
        self.general || self.partial
    }

    pub fn active_levels(&self) -> Vec<AmbiguityLevel> {
        SEVERITY_ORDER.into_iter().filter(|level| self.is_active(*level)).collect()
    }

    /// First active level walking most-severe-first when `reverse`, and
    /// least-severe-first otherwise.
    pub fn lowest_level(&self, reverse: bool) -> Option<AmbiguityLevel> {
        if reverse {
            SEVERITY_ORDER.into_iter().find(|level| self.is_active(*level))
        } else {
            SEVERITY_ORDER.into_iter().rev().find(|level| self.is_active(*level))
        }
    }

    pub fn context(&self, level: AmbiguityLevel) -> Option<&AmbiguityContext> {
        self.unknown.get(&level)
    }

    pub fn observation(&self) -> Option<&str> {
        self.observation.as_deref()
    }

    pub fn set_observation(&mut self, text: impl Into<String>) {
        self.observation = Some(text.into());
    }

    pub fn needs_generation(&self) -> bool {
        self.needs_generation
    }

    /// Picks the clarification to show for this turn. Entities tagged
    /// [`Relation::Ambiguous`] are removed from the active flow either way.
    pub fn ask(
        &mut self,
        flows: &mut FlowStack,
        templates: &dyn ClarificationTemplates,
    ) -> Option<Clarification> {
        if let Some(flow) = flows.active_mut(true) {
            flow.entities_mut().drop_relation(Relation::Ambiguous);
        }

        if let Some(text) = &self.observation {
            return Some(Clarification::Observation { text: text.clone() });
        }

        let level = self.lowest_level(true)?;
        let context = self.unknown.get(&level).cloned().unwrap_or_default();
        let active = flows.active(true);

        if self.needs_generation {
            let entities = active.map(|flow| flow.entities().members()).unwrap_or_default();
            let mut tables = Vec::new();
            for entity in entities {
                if !tables.contains(&entity.table) {
                    tables.push(entity.table.clone());
                }
            }
            return Some(Clarification::Generate(ClarificationRequest {
                level,
                flow: context.flow.or(active.map(|flow| flow.flow_type)),
                goal: active.map(Flow::goal).unwrap_or("understand the request").to_string(),
                tables,
                columns: entities.iter().map(|entity| entity.column.clone()).collect(),
                slot: context.slot,
                values: context.values,
            }));
        }

        Some(Clarification::Templated { level, text: templates.render(active, level, &context) })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AmbiguityDeclaration, AmbiguityLedger, AmbiguityLevel, Clarification, DefaultTemplates,
    };
    use crate::act::{ActCode, Intent};
    use crate::entity::{Entity, Relation};
    use crate::flows::{FlowStack, FlowType};

    #[test]
    fn severity_ordering_prefers_general() {
        let mut ledger = AmbiguityLedger::new();
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::Specific));
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::General));
        assert_eq!(ledger.lowest_level(true), Some(AmbiguityLevel::General));
        assert_eq!(ledger.lowest_level(false), Some(AmbiguityLevel::Specific));
    }

    #[test]
    fn resolving_general_leaves_other_levels() {
        let mut ledger = AmbiguityLedger::new();
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::General));
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::Partial));
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::Confirmation).with_values(["orders"]));

        ledger.resolve(Some(AmbiguityLevel::General));
        assert!(!ledger.is_active(AmbiguityLevel::General));
        assert!(ledger.is_active(AmbiguityLevel::Partial));
        assert!(!ledger.is_active(AmbiguityLevel::Specific));
        assert!(ledger.is_active(AmbiguityLevel::Confirmation));
        assert_eq!(
            ledger.context(AmbiguityLevel::Confirmation).map(|context| context.values.clone()),
            Some(vec!["orders".to_string()])
        );

        ledger.resolve(None);
        assert!(!ledger.present());
    }

    #[test]
    fn ask_strips_ambiguous_entities_from_active_flow() {
        let mut stack = FlowStack::new();
        stack.push(
            FlowType::Query,
            ActCode::QUERY,
            Intent::Analyze,
            &[
                Entity::new("orders", "Total").verified(),
                Entity::new("orders", "Amount").with_relation(Relation::Ambiguous),
            ],
        );
        let mut ledger = AmbiguityLedger::new();
        ledger.declare(
            AmbiguityDeclaration::new(AmbiguityLevel::Confirmation).with_values(["orders.Amount"]),
        );

        let clarification = ledger.ask(&mut stack, &DefaultTemplates).expect("clarification");
        assert!(matches!(
            clarification,
            Clarification::Templated { level: AmbiguityLevel::Confirmation, ref text }
                if text.contains("orders.Amount")
        ));
        let members = stack.active(true).map(|flow| flow.entities().len());
        assert_eq!(members, Some(1));
    }

    #[test]
    fn observation_overrides_templates() {
        let mut ledger = AmbiguityLedger::new();
        ledger.declare(AmbiguityDeclaration::new(AmbiguityLevel::General));
        ledger.set_observation("The orders table has no rows yet.");
        let clarification = ledger.ask(&mut FlowStack::new(), &DefaultTemplates);
        assert_eq!(
            clarification,
            Some(Clarification::Observation { text: "The orders table has no rows yet.".to_string() })
        );
    }

    #[test]
    fn generated_clarification_carries_flow_context() {
        let mut stack = FlowStack::new();
        stack.push(
            FlowType::Plot,
            ActCode::new("003").expect("code"),
            Intent::Visualize,
            &[Entity::new("orders", "Date").verified()],
        );
        let mut ledger = AmbiguityLedger::new();
        ledger.declare(
            AmbiguityDeclaration::new(AmbiguityLevel::Specific)
                .for_flow(FlowType::Plot)
                .for_slot("chart")
                .generated(),
        );

        match ledger.ask(&mut stack, &DefaultTemplates) {
            Some(Clarification::Generate(request)) => {
                assert_eq!(request.flow, Some(FlowType::Plot));
                assert_eq!(request.slot.as_deref(), Some("chart"));
                assert_eq!(request.tables, vec!["orders".to_string()]);
                assert_eq!(request.goal, FlowType::Plot.goal());
            }
            other => panic!("expected generated clarification, got {other:?}"),
        }
    }

    #[test]
    fn nothing_to_ask_without_ambiguity() {
        let mut ledger = AmbiguityLedger::new();
        assert_eq!(ledger.ask(&mut FlowStack::new(), &DefaultTemplates), None);
    }
}
