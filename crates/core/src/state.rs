//! Turns, the per-turn belief state, and the conversation that owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::act::{ActCode, Intent};
use crate::ambiguity::AmbiguityLedger;
use crate::entity::Entity;
use crate::flows::FlowStack;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// Structured UI interaction attached to a turn. It bypasses language
/// understanding and routes straight into slot filling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnAction {
    SelectEntities { entities: Vec<Entity> },
    Confirm,
    Reject,
    AdvanceStage { stage: String },
    CheckStep { name: String },
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<TurnAction>,
    pub created_at: DateTime<Utc>,
}

/// Append-only utterance log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
        action: Option<TurnAction>,
    ) -> &Turn {
        let turn = Turn {
            speaker,
            text: text.into(),
            index: self.turns.len(),
            action,
            created_at: Utc::now(),
        };
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The last `window` turns, oldest first.
    pub fn recent(&self, window: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(window);
        &self.turns[start..]
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::User)
            .map(|turn| turn.text.as_str())
    }

    pub fn transcript(&self, window: usize) -> String {
        self.recent(window)
            .iter()
            .map(|turn| {
                let speaker = match turn.speaker {
                    Speaker::User => "User",
                    Speaker::Agent => "Agent",
                };
                format!("{speaker}: {}", turn.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags {
    pub has_issues: bool,
    pub has_plan: bool,
    pub has_staging: bool,
    pub keep_going: bool,
}

/// Failure recorded while executing a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub code: String,
    pub message: String,
}

/// Belief state after interpreting one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub turn_index: usize,
    pub act: ActCode,
    pub intent: Intent,
    pub entities: Vec<Entity>,
    pub current_table: Option<String>,
    pub thought: String,
    pub ambiguity: AmbiguityLedger,
    pub flags: StateFlags,
    pub errors: Vec<TurnError>,
    pub confidence: f64,
}

impl DialogueState {
    pub fn new(turn_index: usize, act: ActCode) -> Self {
        Self {
            turn_index,
            act,
            intent: act.intent(),
            entities: Vec::new(),
            current_table: None,
            thought: String::new(),
            ambiguity: AmbiguityLedger::new(),
            flags: StateFlags::default(),
            errors: Vec::new(),
            confidence: 0.0,
        }
    }

    pub fn verified_entities(&self) -> Vec<Entity> {
        self.entities.iter().filter(|entity| entity.verified).cloned().collect()
    }

    pub fn record_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.errors.push(TurnError { code: code.into(), message: message.into() });
    }

    /// Compact rendering used inside repair prompts.
    pub fn summary(&self) -> String {
        let entities = self
            .entities
            .iter()
            .map(|entity| {
                let marker = if entity.verified { "" } else { "?" };
                format!("{}.{}{marker}", entity.table, entity.column)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let ambiguity = self
            .ambiguity
            .active_levels()
            .iter()
            .map(|level| level.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = vec![
            format!("act: {} ({})", self.act, self.act.phrase()),
            format!("intent: {}", self.intent),
            format!("table: {}", self.current_table.as_deref().unwrap_or("none")),
            format!("entities: [{entities}]"),
        ];
        if !ambiguity.is_empty() {
            lines.push(format!("ambiguity: [{ambiguity}]"));
        }
        if !self.thought.is_empty() {
            lines.push(format!("thought: {}", self.thought));
        }
        lines.join("\n")
    }
}

/// Append-only record of belief states; the last one is current.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateHistory {
    states: Vec<DialogueState>,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, state: DialogueState) -> &DialogueState {
        self.states.push(state);
        &self.states[self.states.len() - 1]
    }

    pub fn current(&self) -> Option<&DialogueState> {
        self.states.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut DialogueState> {
        self.states.last_mut()
    }

    pub fn previous(&self) -> Option<&DialogueState> {
        self.states.len().checked_sub(2).and_then(|index| self.states.get(index))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Per-conversation state; mutated by one turn at a time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub history: ConversationHistory,
    pub states: StateHistory,
    pub flows: FlowStack,
}

impl Conversation {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: ConversationHistory::new(),
            states: StateHistory::new(),
            flows: FlowStack::new(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationHistory, DialogueState, Speaker, StateHistory};
    use crate::act::ActCode;
    use crate::ambiguity::{AmbiguityDeclaration, AmbiguityLevel};
    use crate::entity::Entity;

    #[test]
    fn history_indices_are_monotonic() {
        let mut history = ConversationHistory::new();
        history.push(Speaker::User, "show me orders", None);
        history.push(Speaker::Agent, "here they are", None);
        history.push(Speaker::User, "now plot them", None);

        let indices = history.turns().iter().map(|turn| turn.index).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(history.recent(2).len(), 2);
        assert_eq!(history.recent(10).len(), 3);
        assert_eq!(history.last_user_text(), Some("now plot them"));
        assert_eq!(history.transcript(1), "User: now plot them");
    }

    #[test]
    fn state_history_tracks_current_and_previous() {
        let mut states = StateHistory::new();
        assert!(states.previous().is_none());
        states.commit(DialogueState::new(0, ActCode::QUERY));
        assert!(states.previous().is_none());
        states.commit(DialogueState::new(1, ActCode::CHAT));
        assert_eq!(states.current().map(|state| state.act), Some(ActCode::CHAT));
        assert_eq!(states.previous().map(|state| state.act), Some(ActCode::QUERY));
    }

    #[test]
    fn summary_lists_entities_and_ambiguity() {
        let mut state = DialogueState::new(3, ActCode::QUERY);
        state.current_table = Some("orders".to_string());
        state.entities = vec![Entity::new("orders", "Total").verified(), Entity::new("orders", "Dt")];
        state.ambiguity.declare(AmbiguityDeclaration::new(AmbiguityLevel::Partial));

        let summary = state.summary();
        assert!(summary.contains("act: 001 (query)"));
        assert!(summary.contains("entities: [orders.Total, orders.Dt?]"));
        assert!(summary.contains("ambiguity: [partial]"));
        assert_eq!(state.verified_entities().len(), 1);
    }
}
