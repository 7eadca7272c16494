//! One turn end to end: track, guard, clarify or act, and answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tabula_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, NoopAuditSink};
use tabula_core::config::AppConfig;
use tabula_core::{
    AmbiguityLevel, ApplicationError, CodeDialect, Conversation, DataStore, DialogueState,
    DomainError, Flow, FlowType, Intent, SchemaCatalog, Slot, Speaker, StateHistory, TabularResult,
    TurnAction,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clarifier::Clarifier;
use crate::entities::{EntityValidator, LlmColumnFinder};
use crate::guardrails::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};
use crate::llm::{complete_within, CompletionOptions, LlmClient};
use crate::nlu::{
    ClassifierPredictor, NearestNeighborRetriever, PatternMatcher, ReasonerPredictor,
    UnderstandingEnsemble,
};
use crate::policy::{ExecutionOutcome, PolicyEngine};
use crate::prompts;
use crate::tracker::{DialogueStateTracker, TrackedTurn};

const PREVIEW_ROWS: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Clarify { level: Option<AmbiguityLevel>, question: String },
    Progress { flow_type: FlowType, detail: String },
    Completed { flow_type: FlowType, code: String, result: TabularResult },
    Failed { message: String },
    Unsupported { reason_code: String, message: String },
    Chat { message: String },
}

impl TurnOutcome {
    /// Text recorded as the agent's turn.
    pub fn message(&self) -> String {
        match self {
            Self::Clarify { question, .. } => question.clone(),
            Self::Progress { detail, .. } => detail.clone(),
            Self::Completed { result, .. } if result.columns.is_empty() => {
                format!("Done. {} rows changed.", result.rows_affected)
            }
            Self::Completed { result, .. } => result.preview(PREVIEW_ROWS),
            Self::Failed { message } | Self::Unsupported { message, .. } | Self::Chat { message } => {
                message.clone()
            }
        }
    }
}

pub struct AgentRuntime {
    tracker: DialogueStateTracker,
    clarifier: Clarifier,
    policy: PolicyEngine,
    guardrails: GuardrailPolicy,
    llm: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
    history_window: usize,
    model_timeout: Duration,
}

impl AgentRuntime {
    pub fn new(
        tracker: DialogueStateTracker,
        clarifier: Clarifier,
        policy: PolicyEngine,
        guardrails: GuardrailPolicy,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            tracker,
            clarifier,
            policy,
            guardrails,
            llm,
            audit: Arc::new(NoopAuditSink),
            history_window: 5,
            model_timeout: Duration::from_secs(30),
        }
    }

    /// Wires the full understanding ensemble, validator and policy engine
    /// from configuration.
    pub async fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn DataStore>,
        catalog: Arc<SchemaCatalog>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.llm.timeout_secs);
        let dialogue = &config.dialogue;

        let retriever = NearestNeighborRetriever::seeded(dialogue.retriever_k).await?;
        let ensemble = UnderstandingEnsemble::new(PatternMatcher::new())
            .with_override_threshold(dialogue.pattern_override_threshold)
            .with_retriever(Arc::new(retriever))
            .with_classifier(Arc::new(ClassifierPredictor::new(llm.clone(), timeout)))
            .with_reasoner(Arc::new(ReasonerPredictor::new(llm.clone(), timeout, config.llm.max_tokens)));
        let validator = EntityValidator::from_config(dialogue)
            .with_finder(Arc::new(LlmColumnFinder::new(llm.clone(), timeout)));
        let tracker = DialogueStateTracker::new(ensemble, validator, catalog)
            .with_history_window(dialogue.history_window);
        let clarifier = Clarifier::default().with_llm(llm.clone(), timeout);
        let policy = PolicyEngine::from_config(llm.clone(), store, dialogue, &config.llm);

        let mut runtime =
            Self::new(tracker, clarifier, policy, GuardrailPolicy::from_config(&config.guardrails), llm);
        runtime.history_window = dialogue.history_window.max(1);
        runtime.model_timeout = timeout;
        Ok(runtime)
    }

    /// The tracker and the runtime report to the same sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.tracker = self.tracker.with_audit(audit.clone());
        self.audit = audit;
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        self.tracker.catalog()
    }

    /// Serialises turns per conversation; distinct conversations proceed in
    /// parallel.
    pub async fn handle(
        &self,
        registry: &ConversationRegistry,
        conversation_id: &str,
        text: &str,
        action: Option<TurnAction>,
    ) -> Result<TurnOutcome, ApplicationError> {
        let conversation = registry.get_or_create(conversation_id).await;
        let mut conversation = conversation.lock().await;
        self.handle_turn(&mut conversation, text, action).await
    }

    pub async fn handle_turn(
        &self,
        conversation: &mut Conversation,
        text: &str,
        action: Option<TurnAction>,
    ) -> Result<TurnOutcome, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let turn_index = conversation.history.push(Speaker::User, text, action).index;
        let tracked = self.tracker.track(conversation, &correlation_id).await?;
        let audit = AuditContext::new(conversation.id.clone(), turn_index, correlation_id, "runtime");

        let outcome = self.respond(conversation, &tracked, &audit).await?;

        tracing::info!(
            event_name = "runtime.turn.completed",
            conversation_id = %conversation.id,
            turn = turn_index,
            act = %tracked.act,
            outcome = outcome_name(&outcome),
        );
        conversation.history.push(Speaker::Agent, outcome.message(), None);
        Ok(outcome)
    }

    async fn respond(
        &self,
        conversation: &mut Conversation,
        tracked: &TrackedTurn,
        audit: &AuditContext,
    ) -> Result<TurnOutcome, ApplicationError> {
        let transcript = conversation.history.transcript(self.history_window);
        let active_type = conversation.flows.active(false).map(|flow| flow.flow_type);
        let raw_dialect = tracked.payload.as_ref().map(|payload| payload.dialect);
        let intent = GuardrailIntent::classify(tracked.act, active_type, raw_dialect);

        let mut run_raw = raw_dialect.is_some();
        match self.guardrails.evaluate(&intent) {
            GuardrailDecision::Allow => {}
            GuardrailDecision::Deny { reason_code, user_message, .. } => {
                tracing::info!(
                    event_name = "runtime.guardrail.denied",
                    conversation_id = %conversation.id,
                    action = %intent.action_key(),
                    reason_code,
                );
                if matches!(intent, GuardrailIntent::DestructiveFlow { .. }) {
                    discard_active(conversation);
                }
                return Ok(TurnOutcome::Unsupported { reason_code: reason_code.to_string(), message: user_message });
            }
            GuardrailDecision::Degrade { reason_code, .. } => {
                tracing::info!(
                    event_name = "runtime.guardrail.degraded",
                    conversation_id = %conversation.id,
                    action = %intent.action_key(),
                    reason_code,
                );
                run_raw = false;
            }
        }

        let state = current_state(&mut conversation.states)?;
        if run_raw {
            if let Some(payload) = &tracked.payload {
                let outcome = self.policy.execute_code(state, &payload.code, payload.dialect).await;
                state.ambiguity.resolve(None);
                discard_active(conversation);
                let flow_type = FlowType::for_act(tracked.act).unwrap_or(FlowType::Query);
                return Ok(self.report(flow_type, outcome, audit, 1));
            }
        }

        if state.ambiguity.present() || state.ambiguity.observation().is_some() {
            if let Some(question) =
                self.clarifier.clarify(&mut state.ambiguity, &mut conversation.flows, &transcript).await
            {
                return Ok(TurnOutcome::Clarify { level: question.level, question: question.text });
            }
        }

        let Some(flow) = conversation.flows.active(false).cloned() else {
            return Ok(self.chat(&transcript).await);
        };
        if flow.flow_type == FlowType::Chat {
            complete_active(conversation);
            return Ok(self.chat(&transcript).await);
        }
        if flow.flow_type == FlowType::Plan {
            return Ok(advance_plan(conversation, &flow));
        }
        if !flow.is_verified() {
            let waiting = flow.unverified_slots();
            return Ok(TurnOutcome::Progress {
                flow_type: flow.flow_type,
                detail: format!("Waiting on {} before I can {}.", waiting.join(", "), flow.goal()),
            });
        }
        if !flow.is_final_stage() {
            let stage = conversation
                .flows
                .active_mut(false)
                .and_then(Flow::advance_stage)
                .unwrap_or_default();
            return Ok(TurnOutcome::Progress {
                flow_type: flow.flow_type,
                detail: format!("Moving on to {stage}."),
            });
        }

        let dialect = dialect_for(flow.family);
        let valid_targets = valid_targets(self.catalog());
        let state = current_state(&mut conversation.states)?;
        let prompt = prompts::code_prompt(&flow, dialect, &state.summary(), self.catalog(), &transcript);
        let preview = state
            .current_table
            .as_deref()
            .map(|table| self.catalog().column_names(table).join(" | "))
            .unwrap_or_default();
        let outcome = self
            .policy
            .execute_with_retries(state, &flow, &prompt, &transcript, &preview, &valid_targets, dialect)
            .await;

        if outcome.is_completed() {
            complete_active(conversation);
        } else {
            discard_active(conversation);
        }
        Ok(self.report(flow.flow_type, outcome, audit, self.policy.max_attempts()))
    }

    fn report(
        &self,
        flow_type: FlowType,
        outcome: ExecutionOutcome,
        audit: &AuditContext,
        attempts: u32,
    ) -> TurnOutcome {
        match outcome {
            ExecutionOutcome::Completed { result, code } => {
                self.audit.emit(
                    audit
                        .event("policy.executed", AuditCategory::Execution, AuditOutcome::Success)
                        .with_metadata("flow_type", flow_type.as_str())
                        .with_metadata("rows", result.row_count().to_string()),
                );
                TurnOutcome::Completed { flow_type, code, result }
            }
            ExecutionOutcome::Rejected { message } => {
                self.audit.emit(
                    audit
                        .event("policy.failed", AuditCategory::Execution, AuditOutcome::Rejected)
                        .with_metadata("flow_type", flow_type.as_str()),
                );
                TurnOutcome::Failed { message: format!("I can't do that with this data: {message}") }
            }
            ExecutionOutcome::Failed { message } => {
                self.audit.emit(
                    audit
                        .event("policy.failed", AuditCategory::Execution, AuditOutcome::Failed)
                        .with_metadata("flow_type", flow_type.as_str())
                        .with_metadata("attempts", attempts.to_string()),
                );
                let message = if attempts <= 1 {
                    format!("That code didn't run: {message}")
                } else {
                    format!(
                        "I wasn't able to {} after {attempts} tries. Could you rephrase or narrow the request?",
                        flow_type.goal()
                    )
                };
                TurnOutcome::Failed { message }
            }
        }
    }

    async fn chat(&self, transcript: &str) -> TurnOutcome {
        let prompt = prompts::chat_prompt(self.catalog(), transcript);
        let options = CompletionOptions::default().with_max_tokens(128);
        let message = match complete_within(self.llm.as_ref(), &prompt, &options, self.model_timeout).await {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => "What would you like to do with your data?".to_string(),
            Err(error) => {
                tracing::warn!(event_name = "runtime.chat.failed", error = %error);
                "What would you like to do with your data?".to_string()
            }
        };
        TurnOutcome::Chat { message }
    }
}

/// Conversations by id, each behind its own lock.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: Mutex<HashMap<String, Arc<Mutex<Conversation>>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Mutex<Conversation>> {
        let mut conversations = self.conversations.lock().await;
        conversations
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Conversation::with_id(id))))
            .clone()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.conversations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.lock().await.is_empty()
    }
}

fn current_state(states: &mut StateHistory) -> Result<&mut DialogueState, ApplicationError> {
    states
        .current_mut()
        .ok_or_else(|| DomainError::InvariantViolation("tracker committed no state".to_string()).into())
}

fn dialect_for(family: Intent) -> CodeDialect {
    match family {
        Intent::Clean | Intent::Transform => CodeDialect::Transform,
        _ => CodeDialect::Query,
    }
}

fn valid_targets(catalog: &SchemaCatalog) -> Vec<String> {
    let mut targets = Vec::new();
    for table in catalog.table_names() {
        targets.push(table.to_string());
        targets.extend(catalog.column_names(table).into_iter().map(str::to_string));
    }
    targets
}

fn complete_active(conversation: &mut Conversation) {
    if let Some(flow) = conversation.flows.active_mut(false) {
        if flow.complete().is_err() {
            flow.invalid = true;
        }
    }
    conversation.flows.pop_completed();
}

fn discard_active(conversation: &mut Conversation) {
    if let Some(flow) = conversation.flows.active_mut(false) {
        flow.invalid = true;
    }
    conversation.flows.pop_completed();
}

/// Plans run one checklist step per turn; the plan completes once every
/// step is checked.
fn advance_plan(conversation: &mut Conversation, flow: &Flow) -> TurnOutcome {
    let next = match flow.slot("steps") {
        Some(Slot::Checklist(steps)) => steps.next_unchecked().map(|step| step.name.clone()),
        _ => None,
    };
    match next {
        Some(step) => TurnOutcome::Progress { flow_type: flow.flow_type, detail: format!("Next step: {step}.") },
        None => {
            complete_active(conversation);
            TurnOutcome::Progress { flow_type: flow.flow_type, detail: "Every step of the plan is done.".to_string() }
        }
    }
}

fn outcome_name(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Clarify { .. } => "clarify",
        TurnOutcome::Progress { .. } => "progress",
        TurnOutcome::Completed { .. } => "completed",
        TurnOutcome::Failed { .. } => "failed",
        TurnOutcome::Unsupported { .. } => "unsupported",
        TurnOutcome::Chat { .. } => "chat",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tabula_core::audit::InMemoryAuditSink;
    use tabula_core::{
        AmbiguityLevel, DataIssue, FlowType, IssueDetector, IssueKind, SchemaCatalog, StoreError,
    };

    use super::{AgentRuntime, ConversationRegistry, TurnOutcome};
    use crate::clarifier::Clarifier;
    use crate::entities::EntityValidator;
    use crate::guardrails::GuardrailPolicy;
    use crate::nlu::{PatternMatcher, UnderstandingEnsemble};
    use crate::policy::PolicyEngine;
    use crate::testing::{sample_catalog, table, ScriptedLlm, ScriptedStore};
    use crate::tracker::DialogueStateTracker;

    struct RegionGaps;

    impl IssueDetector for RegionGaps {
        fn detect(&self, table: &str, _catalog: &SchemaCatalog) -> Vec<DataIssue> {
            vec![DataIssue {
                table: table.to_string(),
                column: "Region".to_string(),
                kind: IssueKind::Missing,
                rows: 4,
                severity: 0.1,
            }]
        }
    }

    fn runtime(llm: Arc<ScriptedLlm>, store: Arc<ScriptedStore>) -> AgentRuntime {
        let tracker = DialogueStateTracker::new(
            UnderstandingEnsemble::new(PatternMatcher::new()),
            EntityValidator::default(),
            Arc::new(sample_catalog()),
        );
        AgentRuntime::new(
            tracker,
            Clarifier::default(),
            PolicyEngine::new(llm.clone(), store),
            GuardrailPolicy::default(),
            llm,
        )
    }

    #[tokio::test]
    async fn grounded_query_runs_and_completes_the_flow() {
        let llm = Arc::new(ScriptedLlm::new(["SELECT Total FROM orders"]));
        let store = Arc::new(ScriptedStore::new([Ok(table(&["Total"], vec![vec![json!(12)]]))]));
        let audit = InMemoryAuditSink::default();
        let runtime = runtime(llm, store.clone()).with_audit(Arc::new(audit.clone()));
        let mut conversation = tabula_core::Conversation::new();

        let outcome =
            runtime.handle_turn(&mut conversation, "show the Total in orders", None).await.expect("turn");

        let TurnOutcome::Completed { flow_type, code, result } = &outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(*flow_type, FlowType::Query);
        assert_eq!(code, "SELECT Total FROM orders");
        assert_eq!(result.row_count(), 1);
        assert!(conversation.flows.is_empty());
        assert_eq!(conversation.history.len(), 2);
        assert_eq!(outcome.message(), "Total\n12");
        assert_eq!(audit.event_types(), vec!["flow.pushed", "policy.executed"]);
        assert_eq!(store.executed().len(), 1);
    }

    #[tokio::test]
    async fn missing_slot_asks_instead_of_executing() {
        let llm = Arc::new(ScriptedLlm::default());
        let store = Arc::new(ScriptedStore::default());
        let runtime = runtime(llm.clone(), store.clone());
        let mut conversation = tabula_core::Conversation::new();

        let outcome = runtime.handle_turn(&mut conversation, "draw a chart", None).await.expect("turn");

        assert!(matches!(outcome, TurnOutcome::Clarify { level: Some(AmbiguityLevel::Specific), .. }));
        assert!(store.executed().is_empty());
        assert!(llm.prompts().is_empty());
        assert_eq!(conversation.flows.active(false).map(|flow| flow.flow_type), Some(FlowType::Plot));
    }

    #[tokio::test]
    async fn unintelligible_first_turn_asks_a_general_question() {
        let llm = Arc::new(ScriptedLlm::default());
        let store = Arc::new(ScriptedStore::default());
        let runtime = runtime(llm, store.clone());
        let mut conversation = tabula_core::Conversation::new();

        let outcome = runtime.handle_turn(&mut conversation, "lorem ipsum", None).await.expect("turn");

        let TurnOutcome::Clarify { level, question } = outcome else {
            panic!("expected a clarifying question, got {outcome:?}");
        };
        assert_eq!(level, Some(AmbiguityLevel::General));
        assert!(question.contains("rephrase"));
        assert!(conversation.flows.is_empty());
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_in_plain_language() {
        let llm = Arc::new(ScriptedLlm::new(["SELECT a FROM orders", "SELECT b FROM orders", "SELECT c FROM orders"]));
        let store = Arc::new(ScriptedStore::new((0..3).map(|_| Err(StoreError::Execution("no such column".to_string())))));
        let audit = InMemoryAuditSink::default();
        let runtime = runtime(llm, store.clone()).with_audit(Arc::new(audit.clone()));
        let mut conversation = tabula_core::Conversation::new();

        let outcome =
            runtime.handle_turn(&mut conversation, "show the Total in orders", None).await.expect("turn");

        let TurnOutcome::Failed { message } = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("after 3 tries"));
        assert!(!message.contains("no such column"));
        assert_eq!(store.executed().len(), 3);
        assert_eq!(conversation.states.current().map(|state| state.errors.len()), Some(3));
        assert!(audit.event_types().contains(&"policy.failed".to_string()));
        assert!(conversation.flows.is_empty());
    }

    #[tokio::test]
    async fn destructive_flow_is_refused_by_default() {
        let runtime = runtime(Arc::new(ScriptedLlm::default()), Arc::new(ScriptedStore::default()));
        let mut conversation = tabula_core::Conversation::new();

        let outcome =
            runtime.handle_turn(&mut conversation, "/act 07C", None).await.expect("turn");

        assert!(matches!(
            outcome,
            TurnOutcome::Unsupported { ref reason_code, .. } if reason_code == "destructive_flow_disabled"
        ));
        assert!(conversation.flows.is_empty());
    }

    #[tokio::test]
    async fn slash_sql_runs_once_without_generation() {
        let llm = Arc::new(ScriptedLlm::default());
        let store = Arc::new(ScriptedStore::default());
        let runtime = runtime(llm.clone(), store.clone());
        let mut conversation = tabula_core::Conversation::new();

        let outcome =
            runtime.handle_turn(&mut conversation, "/sql SELECT COUNT(*) FROM orders", None).await.expect("turn");

        assert!(matches!(outcome, TurnOutcome::Completed { ref code, .. } if code == "SELECT COUNT(*) FROM orders"));
        assert!(llm.prompts().is_empty());
        assert_eq!(store.executed().len(), 1);
    }

    #[tokio::test]
    async fn data_issues_interrupt_then_run_after_confirmation() {
        let llm = Arc::new(ScriptedLlm::new(["SELECT * FROM orders WHERE Region IS NULL"]));
        let store = Arc::new(ScriptedStore::default());
        let tracker = DialogueStateTracker::new(
            UnderstandingEnsemble::new(PatternMatcher::new()),
            EntityValidator::default(),
            Arc::new(sample_catalog()),
        )
        .with_detector(Arc::new(RegionGaps));
        let runtime = AgentRuntime::new(
            tracker,
            Clarifier::default(),
            PolicyEngine::new(llm.clone(), store.clone()),
            GuardrailPolicy::default(),
            llm,
        );
        let mut conversation = tabula_core::Conversation::new();

        let first =
            runtime.handle_turn(&mut conversation, "show the Total in orders", None).await.expect("turn");
        let TurnOutcome::Clarify { level, question } = first else {
            panic!("expected the issue observation");
        };
        assert_eq!(level, None);
        assert!(question.contains("possible data issues in orders"));
        assert!(store.executed().is_empty());

        let second = runtime.handle_turn(&mut conversation, "yes", None).await.expect("turn");
        assert!(matches!(second, TurnOutcome::Completed { flow_type: FlowType::ResolveIssues, .. }));
        assert_eq!(conversation.flows.active(false).map(|flow| flow.flow_type), Some(FlowType::Query));
    }

    #[tokio::test]
    async fn registry_keeps_conversations_apart() {
        let llm = Arc::new(ScriptedLlm::new(["Hello there.", "Hi again."]));
        let runtime = runtime(llm, Arc::new(ScriptedStore::default()));
        let registry = ConversationRegistry::new();

        let (left, right) = tokio::join!(
            runtime.handle(&registry, "left", "hello", None),
            runtime.handle(&registry, "right", "hi", None),
        );
        assert!(matches!(left, Ok(TurnOutcome::Chat { .. })));
        assert!(matches!(right, Ok(TurnOutcome::Chat { .. })));
        assert_eq!(registry.len().await, 2);

        let left = registry.get_or_create("left").await;
        assert_eq!(left.lock().await.history.len(), 2);
    }
}
