//! Typed, partially-fillable task parameters.
//!
//! Each flow owns a set of slots. The five families share a `filled` and a
//! `verified` predicate but otherwise keep their own mutation contract.

pub mod checklist;
pub mod formula;
pub mod source;

use serde::{Deserialize, Serialize};

pub use checklist::{ChecklistItem, ChecklistSlot};
pub use formula::{Aggregation, FormulaNode, FormulaRelation, FormulaSlot};
pub use source::SourceSlot;

/// Free-text values such as a chart type or a new column name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeTextSlot {
    values: Vec<String>,
}

impl FreeTextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn add_one(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() || self.values.iter().any(|existing| existing == trimmed) {
            return false;
        }
        self.values.push(trimmed.to_string());
        true
    }

    pub fn is_filled(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Numeric level compared against a threshold; `inverted` means the slot is
/// filled when the level is *below* the threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelSlot {
    pub threshold: f64,
    pub inverted: bool,
    level: Option<f64>,
}

impl LevelSlot {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, inverted: false, level: None }
    }

    pub fn below(threshold: f64) -> Self {
        Self { threshold, inverted: true, level: None }
    }

    pub fn level(&self) -> Option<f64> {
        self.level
    }

    pub fn assign_one(&mut self, level: f64) {
        self.level = Some(level);
    }

    pub fn is_filled(&self) -> bool {
        match self.level {
            Some(level) if self.inverted => level < self.threshold,
            Some(level) => level >= self.threshold,
            None => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Slot {
    Source(SourceSlot),
    FreeText(FreeTextSlot),
    Checklist(ChecklistSlot),
    Formula(FormulaSlot),
    Level(LevelSlot),
}

impl Slot {
    pub fn is_filled(&self) -> bool {
        match self {
            Self::Source(slot) => slot.is_filled(),
            Self::FreeText(slot) => slot.is_filled(),
            Self::Checklist(slot) => slot.is_filled(),
            Self::Formula(slot) => slot.is_filled(),
            Self::Level(slot) => slot.is_filled(),
        }
    }

    /// Free text and levels carry no separate verification step.
    pub fn is_verified(&self) -> bool {
        match self {
            Self::Source(slot) => slot.is_verified(),
            Self::Checklist(slot) => slot.is_verified(),
            Self::Formula(slot) => slot.check_if_verified(),
            Self::FreeText(_) | Self::Level(_) => self.is_filled(),
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::FreeText(_) => "free_text",
            Self::Checklist(_) => "checklist",
            Self::Formula(_) => "formula",
            Self::Level(_) => "level",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPriority {
    Required,
    Elective,
    Optional,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub slot: Slot,
    pub priority: SlotPriority,
}

impl SlotEntry {
    pub fn required(slot: Slot) -> Self {
        Self { slot, priority: SlotPriority::Required }
    }

    pub fn elective(slot: Slot) -> Self {
        Self { slot, priority: SlotPriority::Elective }
    }

    pub fn optional(slot: Slot) -> Self {
        Self { slot, priority: SlotPriority::Optional }
    }
}

#[cfg(test)]
mod tests {
    use super::{FreeTextSlot, LevelSlot, Slot};

    #[test]
    fn level_slot_respects_inversion() {
        let mut above = LevelSlot::new(0.5);
        assert!(!above.is_filled());
        above.assign_one(0.5);
        assert!(above.is_filled());

        let mut below = LevelSlot::below(0.3);
        below.assign_one(0.5);
        assert!(!below.is_filled());
        below.assign_one(0.1);
        assert!(below.is_filled());
    }

    #[test]
    fn free_text_needs_one_non_blank_value() {
        let mut slot = FreeTextSlot::new();
        assert!(!slot.add_one("   "));
        assert!(!Slot::FreeText(slot.clone()).is_filled());
        assert!(slot.add_one(" bar chart "));
        assert_eq!(slot.values(), ["bar chart".to_string()]);
        assert!(Slot::FreeText(slot).is_verified());
    }
}
