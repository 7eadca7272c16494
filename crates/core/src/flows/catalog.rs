//! Flow types and the static dispatch table from act codes to flow
//! constructors.

use serde::{Deserialize, Serialize};

use crate::act::{ActCode, Intent};
use crate::flows::flow::Flow;
use crate::slots::{
    ChecklistSlot, FormulaSlot, FreeTextSlot, LevelSlot, Slot, SlotEntry, SlotPriority, SourceSlot,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Query,
    Measure,
    Pivot,
    Plan,
    Plot,
    UpdateRows,
    Dedupe,
    InsertColumn,
    DeleteColumn,
    MergeTables,
    ResolveIssues,
    Chat,
}

const DISPATCH: [(ActCode, FlowType); 12] = [
    (ActCode::raw(*b"001"), FlowType::Query),
    (ActCode::raw(*b"002"), FlowType::Measure),
    (ActCode::raw(*b"01A"), FlowType::Pivot),
    (ActCode::raw(*b"01D"), FlowType::Plan),
    (ActCode::raw(*b"003"), FlowType::Plot),
    (ActCode::raw(*b"06B"), FlowType::UpdateRows),
    (ActCode::raw(*b"7BD"), FlowType::Dedupe),
    (ActCode::raw(*b"05C"), FlowType::InsertColumn),
    (ActCode::raw(*b"07C"), FlowType::DeleteColumn),
    (ActCode::raw(*b"5AD"), FlowType::MergeTables),
    (ActCode::raw(*b"69B"), FlowType::ResolveIssues),
    (ActCode::raw(*b"000"), FlowType::Chat),
];

const MERGE_STAGES: [&str; 3] = ["pick-tab-col", "merge-style", "combine-cards"];

impl FlowType {
    /// Flow constructor for an act code; `None` for codes with no flow.
    pub fn for_act(act: ActCode) -> Option<Self> {
        if act.is_unsupported() {
            return None;
        }
        DISPATCH.iter().find(|(code, _)| *code == act).map(|(_, flow_type)| *flow_type)
    }

    pub fn canonical_act(self) -> ActCode {
        DISPATCH
            .iter()
            .find(|(_, flow_type)| *flow_type == self)
            .map(|(code, _)| *code)
            .unwrap_or(ActCode::CHAT)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Measure => "measure",
            Self::Pivot => "pivot",
            Self::Plan => "plan",
            Self::Plot => "plot",
            Self::UpdateRows => "update_rows",
            Self::Dedupe => "dedupe",
            Self::InsertColumn => "insert_column",
            Self::DeleteColumn => "delete_column",
            Self::MergeTables => "merge_tables",
            Self::ResolveIssues => "resolve_issues",
            Self::Chat => "chat",
        }
    }

    pub fn family(self) -> Intent {
        match self {
            Self::Query | Self::Measure | Self::Pivot | Self::Plan => Intent::Analyze,
            Self::Plot => Intent::Visualize,
            Self::UpdateRows | Self::Dedupe => Intent::Clean,
            Self::InsertColumn | Self::DeleteColumn | Self::MergeTables => Intent::Transform,
            Self::ResolveIssues => Intent::Detect,
            Self::Chat => Intent::Converse,
        }
    }

    pub fn goal(self) -> &'static str {
        match self {
            Self::Query => "answer a question by querying the data",
            Self::Measure => "calculate a metric from a formula over columns",
            Self::Pivot => "summarize one column grouped by another",
            Self::Plan => "carry out a multi-step analysis plan",
            Self::Plot => "draw a chart of the selected columns",
            Self::UpdateRows => "change values in the selected rows",
            Self::Dedupe => "remove duplicate rows",
            Self::InsertColumn => "add a new derived column",
            Self::DeleteColumn => "remove a column",
            Self::MergeTables => "combine two tables into one",
            Self::ResolveIssues => "review data quality issues found in the table",
            Self::Chat => "chat about the data",
        }
    }

    pub fn stages(self) -> &'static [&'static str] {
        match self {
            Self::MergeTables => &MERGE_STAGES,
            _ => &[],
        }
    }

    pub fn fallback(self) -> Option<FlowType> {
        match self {
            Self::ResolveIssues => Some(Self::Query),
            Self::Pivot => Some(Self::Query),
            _ => None,
        }
    }

    /// True for flows whose execution mutates the store.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::DeleteColumn | Self::UpdateRows | Self::Dedupe)
    }

    /// Builds a fresh flow; the intent is derived from `act`.
    pub fn build(self, act: ActCode) -> Flow {
        let (entity_priority, min_size, slots) = self.slot_layout();
        Flow::assemble(
            self,
            act,
            act.intent(),
            "source",
            entity_priority,
            SourceSlot::new(min_size),
            slots,
        )
    }

    fn slot_layout(self) -> (SlotPriority, usize, Vec<(&'static str, SlotEntry)>) {
        let text = || Slot::FreeText(FreeTextSlot::new());
        match self {
            Self::Query => {
                (SlotPriority::Required, 1, vec![("operation", SlotEntry::elective(text()))])
            }
            Self::Measure => (
                SlotPriority::Required,
                1,
                vec![
                    ("metric", SlotEntry::required(Slot::Formula(FormulaSlot::new()))),
                    ("time", SlotEntry::optional(text())),
                ],
            ),
            Self::Pivot => {
                (SlotPriority::Required, 2, vec![("operation", SlotEntry::elective(text()))])
            }
            Self::Plan => (
                SlotPriority::Optional,
                1,
                vec![("steps", SlotEntry::required(Slot::Checklist(ChecklistSlot::new(2))))],
            ),
            Self::Plot => (SlotPriority::Required, 1, vec![("chart", SlotEntry::elective(text()))]),
            Self::UpdateRows => {
                (SlotPriority::Required, 1, vec![("change", SlotEntry::required(text()))])
            }
            Self::Dedupe => (
                SlotPriority::Required,
                1,
                vec![
                    ("strategy", SlotEntry::elective(text())),
                    ("confidence", SlotEntry::elective(Slot::Level(LevelSlot::new(0.5)))),
                ],
            ),
            Self::InsertColumn => {
                (SlotPriority::Required, 1, vec![("target", SlotEntry::required(text()))])
            }
            Self::DeleteColumn => (SlotPriority::Required, 1, Vec::new()),
            Self::MergeTables => {
                (SlotPriority::Required, 2, vec![("style", SlotEntry::required(text()))])
            }
            Self::ResolveIssues => (
                SlotPriority::Required,
                1,
                vec![("severity", SlotEntry::elective(Slot::Level(LevelSlot::below(0.3))))],
            ),
            Self::Chat => (SlotPriority::Optional, 0, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowType, DISPATCH};
    use crate::act::{ActCode, Intent};

    #[test]
    fn every_dispatch_entry_round_trips() {
        for (code, flow_type) in DISPATCH {
            assert_eq!(FlowType::for_act(code), Some(flow_type));
            assert_eq!(flow_type.canonical_act(), code);
            let flow = flow_type.build(code);
            assert_eq!(flow.entity_slot(), "source");
            assert_eq!(flow.family, code.intent(), "family mismatch for {flow_type:?}");
        }
    }

    #[test]
    fn unknown_and_denylisted_codes_have_no_flow() {
        assert_eq!(FlowType::for_act(ActCode::new("0AF").expect("code")), None);
        assert_eq!(FlowType::for_act(ActCode::new("07A").expect("code")), None);
        assert_eq!(FlowType::for_act(ActCode::UNSUPPORTED), None);
    }

    #[test]
    fn chat_flow_is_filled_immediately() {
        let flow = FlowType::Chat.build(ActCode::CHAT);
        assert!(flow.is_filled());
        assert_eq!(flow.intent, Intent::Converse);
    }

    #[test]
    fn issue_flow_falls_back_to_query() {
        let flow = FlowType::ResolveIssues.build(ActCode::new("69B").expect("code"));
        assert_eq!(flow.fallback, Some(FlowType::Query));
        assert_eq!(flow.family, Intent::Detect);
    }
}
