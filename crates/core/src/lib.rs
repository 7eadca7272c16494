pub mod act;
pub mod ambiguity;
pub mod audit;
pub mod config;
pub mod entity;
pub mod errors;
pub mod flows;
pub mod issues;
pub mod schema;
pub mod slots;
pub mod state;
pub mod store;

pub use act::{ActCode, ActCodeError, ActPhrase, ActToken, Intent, UNSUPPORTED_ACTS};
pub use ambiguity::{
    AmbiguityContext, AmbiguityDeclaration, AmbiguityLedger, AmbiguityLevel, Clarification,
    ClarificationRequest, ClarificationTemplates, DefaultTemplates,
};
pub use entity::{dedupe_entities, Entity, Relation};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{Flow, FlowError, FlowLifecycle, FlowStack, FlowStackError, FlowType};
pub use issues::{DataIssue, IssueDetector, IssueKind, NoIssues};
pub use schema::{ColumnSchema, SchemaCatalog, WILDCARD_COLUMN};
pub use slots::{Slot, SlotEntry, SlotPriority};
pub use state::{
    Conversation, ConversationHistory, DialogueState, Speaker, StateFlags, StateHistory, Turn,
    TurnAction, TurnError,
};
pub use store::{CodeDialect, DataStore, StoreError, TabularResult};
