use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::act::{ActCode, Intent};
use crate::entity::Entity;
use crate::flows::catalog::FlowType;
use crate::slots::{FormulaNode, Slot, SlotEntry, SlotPriority, SourceSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowLifecycle {
    Pending,
    Active,
    NeedsThought,
    Filled,
    Completed,
    Interjected,
    Invalid,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow {flow_type:?} cannot complete, missing slots: {missing:?}")]
    NotReady { flow_type: FlowType, missing: Vec<String> },
    #[error("flow {flow_type:?} has no stage named `{stage}`")]
    UnknownStage { flow_type: FlowType, stage: String },
}

/// One task instance. The entity slot is held apart from the other slots so
/// every flow has exactly one grounding slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub flow_type: FlowType,
    pub family: Intent,
    pub act: ActCode,
    pub intent: Intent,
    entity_slot: String,
    entity_priority: SlotPriority,
    entities: SourceSlot,
    slots: Vec<(String, SlotEntry)>,
    pub completed: bool,
    pub interjected: bool,
    pub is_uncertain: bool,
    pub is_newborn: bool,
    pub invalid: bool,
    pub fallback: Option<FlowType>,
    stage: Option<usize>,
}

impl Flow {
    pub(crate) fn assemble(
        flow_type: FlowType,
        act: ActCode,
        intent: Intent,
        entity_slot: &str,
        entity_priority: SlotPriority,
        entities: SourceSlot,
        slots: Vec<(&str, SlotEntry)>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_type,
            family: flow_type.family(),
            act,
            intent,
            entity_slot: entity_slot.to_string(),
            entity_priority,
            entities,
            slots: slots.into_iter().map(|(name, entry)| (name.to_string(), entry)).collect(),
            completed: false,
            interjected: false,
            is_uncertain: false,
            is_newborn: true,
            invalid: false,
            fallback: flow_type.fallback(),
            stage: if flow_type.stages().is_empty() { None } else { Some(0) },
        }
    }

    pub fn entity_slot(&self) -> &str {
        &self.entity_slot
    }

    pub fn entities(&self) -> &SourceSlot {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut SourceSlot {
        &mut self.entities
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|(slot_name, _)| slot_name == name).map(|(_, entry)| &entry.slot)
    }

    pub fn slot_mut(&mut self, name: &str) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|(slot_name, _)| slot_name == name)
            .map(|(_, entry)| &mut entry.slot)
    }

    pub fn slot_names(&self) -> Vec<&str> {
        std::iter::once(self.entity_slot.as_str())
            .chain(self.slots.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    /// Routes entities into the entity slot, returning how many were new.
    pub fn fill_entities(&mut self, entities: &[Entity], active_table: Option<&str>) -> usize {
        entities
            .iter()
            .filter(|entity| self.entities.add_one((*entity).clone(), active_table))
            .count()
    }

    /// Writes a loosely typed value into a named slot through that slot
    /// family's own mutation; returns whether anything was applied.
    pub fn fill_slot(&mut self, name: &str, value: &serde_json::Value) -> bool {
        let Some(slot) = self.slot_mut(name) else {
            return false;
        };
        match (slot, value) {
            (Slot::FreeText(text), serde_json::Value::String(value)) => text.add_one(value.as_str()),
            (Slot::FreeText(text), serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(serde_json::Value::as_str)
                .fold(false, |added, value| text.add_one(value) || added),
            (Slot::Level(level), value) => match value.as_f64() {
                Some(number) => {
                    level.assign_one(number);
                    true
                }
                None => false,
            },
            (Slot::Checklist(checklist), serde_json::Value::String(step)) => {
                checklist.add_one(step.as_str(), "")
            }
            (Slot::Checklist(checklist), serde_json::Value::Array(steps)) => {
                steps.iter().fold(false, |added, step| {
                    let name = step.get("name").and_then(|name| name.as_str()).or(step.as_str());
                    let description =
                        step.get("description").and_then(|text| text.as_str()).unwrap_or_default();
                    match name {
                        Some(name) => checklist.add_one(name, description) || added,
                        None => added,
                    }
                })
            }
            (Slot::Formula(formula), value) => {
                match serde_json::from_value::<FormulaNode>(value.clone()) {
                    Ok(node) => {
                        formula.assign_one(node);
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    fn slot_states(&self) -> impl Iterator<Item = (&str, SlotPriority, bool, bool)> + '_ {
        std::iter::once((
            self.entity_slot.as_str(),
            self.entity_priority,
            self.entities.is_filled(),
            self.entities.is_verified(),
        ))
        .chain(self.slots.iter().map(|(name, entry)| {
            (name.as_str(), entry.priority, entry.slot.is_filled(), entry.slot.is_verified())
        }))
    }

    /// All required slots filled, and at least one elective slot filled when
    /// the flow declares any.
    pub fn is_filled(&self) -> bool {
        let mut required_filled = true;
        let mut has_elective = false;
        let mut elective_filled = false;
        for (_, priority, filled, _) in self.slot_states() {
            match priority {
                SlotPriority::Required => required_filled &= filled,
                SlotPriority::Elective => {
                    has_elective = true;
                    elective_filled |= filled;
                }
                SlotPriority::Optional => {}
            }
        }
        required_filled && (!has_elective || elective_filled)
    }

    pub fn is_verified(&self) -> bool {
        self.is_filled() && self.slot_states().all(|(_, _, filled, verified)| !filled || verified)
    }

    /// Unfilled required slots, or the elective group when none is filled.
    pub fn missing_slots(&self) -> Vec<String> {
        let mut missing = self
            .slot_states()
            .filter(|(_, priority, filled, _)| *priority == SlotPriority::Required && !filled)
            .map(|(name, ..)| name.to_string())
            .collect::<Vec<_>>();

        let electives = self
            .slot_states()
            .filter(|(_, priority, ..)| *priority == SlotPriority::Elective)
            .collect::<Vec<_>>();
        if !electives.is_empty() && electives.iter().all(|(_, _, filled, _)| !filled) {
            missing.extend(electives.iter().map(|(name, ..)| name.to_string()));
        }
        missing
    }

    /// Filled slots whose contents still await verification.
    pub fn unverified_slots(&self) -> Vec<String> {
        self.slot_states()
            .filter(|(_, _, filled, verified)| *filled && !verified)
            .map(|(name, ..)| name.to_string())
            .collect()
    }

    pub fn lifecycle(&self) -> FlowLifecycle {
        if self.invalid {
            FlowLifecycle::Invalid
        } else if self.completed {
            FlowLifecycle::Completed
        } else if self.interjected {
            FlowLifecycle::Interjected
        } else if self.is_uncertain {
            FlowLifecycle::NeedsThought
        } else if self.is_verified() {
            FlowLifecycle::Filled
        } else if self.is_newborn {
            FlowLifecycle::Pending
        } else {
            FlowLifecycle::Active
        }
    }

    pub fn complete(&mut self) -> Result<(), FlowError> {
        if !self.is_filled() {
            return Err(FlowError::NotReady { flow_type: self.flow_type, missing: self.missing_slots() });
        }
        if !self.is_verified() {
            return Err(FlowError::NotReady {
                flow_type: self.flow_type,
                missing: self.unverified_slots(),
            });
        }
        self.completed = true;
        Ok(())
    }

    pub fn goal(&self) -> &'static str {
        self.flow_type.goal()
    }

    pub fn stage(&self) -> Option<&'static str> {
        self.stage.and_then(|index| self.flow_type.stages().get(index).copied())
    }

    pub fn is_final_stage(&self) -> bool {
        match self.stage {
            Some(index) => index + 1 >= self.flow_type.stages().len(),
            None => true,
        }
    }

    pub fn advance_stage(&mut self) -> Option<&'static str> {
        let stages = self.flow_type.stages();
        if let Some(index) = self.stage {
            self.stage = Some((index + 1).min(stages.len().saturating_sub(1)));
        }
        self.stage()
    }

    pub fn set_stage(&mut self, stage: &str) -> Result<(), FlowError> {
        let index = self
            .flow_type
            .stages()
            .iter()
            .position(|candidate| *candidate == stage)
            .ok_or_else(|| FlowError::UnknownStage {
                flow_type: self.flow_type,
                stage: stage.to_string(),
            })?;
        self.stage = Some(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::act::ActCode;
    use crate::entity::Entity;
    use crate::flows::catalog::FlowType;
    use crate::flows::flow::{FlowError, FlowLifecycle};
    use crate::slots::{Aggregation, FormulaNode, FormulaRelation, Slot};

    #[test]
    fn source_min_size_two_flips_on_second_distinct_pair() {
        let mut flow = FlowType::Pivot.build(ActCode::new("01A").expect("code"));
        if let Some(Slot::FreeText(operation)) = flow.slot_mut("operation") {
            operation.add_one("count by region");
        }

        flow.fill_entities(&[Entity::new("orders", "Region")], None);
        assert!(!flow.is_filled());
        flow.fill_entities(&[Entity::new("orders", "Region")], None);
        assert!(!flow.is_filled(), "repeating a pair must not count twice");
        flow.fill_entities(&[Entity::new("orders", "Total")], None);
        assert!(flow.is_filled());
    }

    #[test]
    fn filling_more_slots_never_unfills() {
        let mut flow = FlowType::Dedupe.build(ActCode::new("7BD").expect("code"));
        flow.fill_entities(&[Entity::new("customers", "Email").verified()], None);
        if let Some(Slot::FreeText(strategy)) = flow.slot_mut("strategy") {
            strategy.add_one("keep newest");
        }
        assert!(flow.is_filled());

        flow.fill_entities(&[Entity::new("customers", "Name")], None);
        assert!(flow.is_filled());
        if let Some(Slot::Level(confidence)) = flow.slot_mut("confidence") {
            confidence.assign_one(0.9);
        }
        assert!(flow.is_filled());
        if let Some(Slot::FreeText(strategy)) = flow.slot_mut("strategy") {
            strategy.add_one("merge");
        }
        assert!(flow.is_filled());
    }

    #[test]
    fn elective_group_reported_when_empty() {
        let mut flow = FlowType::Query.build(ActCode::QUERY);
        assert_eq!(flow.missing_slots(), vec!["source".to_string(), "operation".to_string()]);
        flow.fill_entities(&[Entity::new("orders", "Total")], None);
        assert_eq!(flow.missing_slots(), vec!["operation".to_string()]);
    }

    #[test]
    fn completion_requires_verification() {
        let mut flow = FlowType::Measure.build(ActCode::new("002").expect("code"));
        flow.fill_entities(&[Entity::new("orders", "Total").verified()], None);
        if let Some(Slot::Formula(metric)) = flow.slot_mut("metric") {
            metric.assign_one(
                FormulaNode::expression("revenue", FormulaRelation::Add).with_child(
                    FormulaNode::clause("total", "orders", "Total", Aggregation::Sum),
                ),
            );
        }
        assert!(flow.is_filled());
        assert_eq!(flow.lifecycle(), FlowLifecycle::Pending);
        assert!(matches!(flow.complete(), Err(FlowError::NotReady { ref missing, .. }) if missing == &vec!["metric".to_string()]));

        if let Some(Slot::Formula(metric)) = flow.slot_mut("metric") {
            metric.mark_verified("total");
        }
        assert_eq!(flow.lifecycle(), FlowLifecycle::Filled);
        flow.complete().expect("flow completes");
        assert_eq!(flow.lifecycle(), FlowLifecycle::Completed);
    }

    #[test]
    fn merge_walks_its_stages() {
        let mut flow = FlowType::MergeTables.build(ActCode::new("5AD").expect("code"));
        assert_eq!(flow.stage(), Some("pick-tab-col"));
        assert_eq!(flow.advance_stage(), Some("merge-style"));
        assert_eq!(flow.advance_stage(), Some("combine-cards"));
        assert!(flow.is_final_stage());
        assert_eq!(flow.advance_stage(), Some("combine-cards"));
        flow.set_stage("merge-style").expect("known stage");
        assert!(flow.set_stage("bogus").is_err());
    }

    #[test]
    fn loosely_typed_values_fill_by_slot_family() {
        let mut flow = FlowType::Dedupe.build(ActCode::new("7BD").expect("code"));
        assert!(flow.fill_slot("strategy", &serde_json::json!("keep newest")));
        assert!(flow.fill_slot("confidence", &serde_json::json!(0.75)));
        assert!(!flow.fill_slot("confidence", &serde_json::json!("high")));
        assert!(!flow.fill_slot("missing", &serde_json::json!("x")));

        let mut plan = FlowType::Plan.build(ActCode::new("01D").expect("code"));
        assert!(plan.fill_slot(
            "steps",
            &serde_json::json!([{"name": "filter", "description": "keep 2024"}, "aggregate"])
        ));
        assert!(plan.is_filled());

        let mut measure = FlowType::Measure.build(ActCode::new("002").expect("code"));
        let metric = serde_json::json!({
            "kind": "expression",
            "name": "revenue",
            "relation": "add",
            "children": [{
                "kind": "clause",
                "name": "total",
                "table": "orders",
                "column": "Total",
                "aggregation": "sum",
                "verified": true
            }]
        });
        assert!(measure.fill_slot("metric", &metric));
        assert!(measure.slot("metric").is_some_and(|slot| slot.is_verified()));
    }
}
