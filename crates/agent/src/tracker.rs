//! Turns one user utterance into the next belief state and keeps the flow
//! stack in step with it.

use std::sync::Arc;

use tabula_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, NoopAuditSink};
use tabula_core::{
    ActCode, AmbiguityDeclaration, AmbiguityLevel, Conversation, DataIssue, DialogueState,
    DomainError, Entity, FlowStack, FlowType, IssueDetector, NoIssues, SchemaCatalog, Slot,
    TurnAction,
};

use crate::entities::EntityValidator;
use crate::nlu::{PredictionSource, RawCode, UnderstandingContext, UnderstandingEnsemble};

/// Below this the understanding is treated as not understood at all.
pub const GENERAL_AMBIGUITY_THRESHOLD: f64 = 0.2;

/// What the tracker concluded for the turn, beyond the committed state.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedTurn {
    pub act: ActCode,
    pub confidence: f64,
    /// `None` when a structured action bypassed understanding.
    pub source: Option<PredictionSource>,
    pub payload: Option<RawCode>,
}

pub struct DialogueStateTracker {
    ensemble: UnderstandingEnsemble,
    validator: EntityValidator,
    catalog: Arc<SchemaCatalog>,
    detector: Arc<dyn IssueDetector>,
    audit: Arc<dyn AuditSink>,
    history_window: usize,
}

impl DialogueStateTracker {
    pub fn new(ensemble: UnderstandingEnsemble, validator: EntityValidator, catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            ensemble,
            validator,
            catalog,
            detector: Arc::new(NoIssues),
            audit: Arc::new(NoopAuditSink),
            history_window: 5,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn IssueDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Interprets the latest turn in `conversation.history` and commits the
    /// resulting state.
    pub async fn track(
        &self,
        conversation: &mut Conversation,
        correlation_id: &str,
    ) -> Result<TrackedTurn, DomainError> {
        let turn = conversation
            .history
            .last()
            .cloned()
            .ok_or_else(|| DomainError::InvariantViolation("no turn to track".to_string()))?;
        let audit = AuditContext::new(conversation.id.clone(), turn.index, correlation_id, "tracker");
        let previous = conversation.states.current().cloned();
        let carried_table = previous.as_ref().and_then(|state| state.current_table.clone());

        if let Some(action) = &turn.action {
            let act = previous.as_ref().map(|state| state.act).unwrap_or(ActCode::CHAT);
            let mut state = carry_over(DialogueState::new(turn.index, act), previous.as_ref());
            state.confidence = 1.0;
            self.apply_action(&mut conversation.flows, action, &mut state, &audit).await?;
            state.entities = active_entities(&conversation.flows);
            let tracked = TrackedTurn { act, confidence: 1.0, source: None, payload: None };
            self.finish(conversation, state, &audit);
            return Ok(tracked);
        }

        let context = UnderstandingContext::new(
            conversation.history.recent(self.history_window),
            &self.catalog,
        )
        .with_current_table(carried_table.as_deref());
        let prediction = self.ensemble.understand(&context).await;

        let mut state = carry_over(DialogueState::new(turn.index, prediction.act), previous.as_ref());
        state.confidence = prediction.confidence;
        state.thought = prediction.thought.clone().unwrap_or_default();
        let tracked = TrackedTurn {
            act: prediction.act,
            confidence: prediction.confidence,
            source: Some(prediction.source),
            payload: prediction.payload.clone(),
        };

        if prediction.act == ActCode::CONFIRM || prediction.act == ActCode::DENY {
            let action = if prediction.act == ActCode::CONFIRM { TurnAction::Confirm } else { TurnAction::Reject };
            self.apply_action(&mut conversation.flows, &action, &mut state, &audit).await?;
            state.entities = active_entities(&conversation.flows);
            self.finish(conversation, state, &audit);
            return Ok(tracked);
        }

        if prediction.act.is_unsupported() {
            self.finish(conversation, state, &audit);
            return Ok(tracked);
        }

        let mut entities = self
            .validator
            .validate(prediction.entities.clone(), &self.catalog, state.current_table.as_deref(), &mut state.ambiguity)
            .await;
        if state.ambiguity.is_deep() {
            if let Some(previous) = &previous {
                tracing::debug!(
                    event_name = "dst.entities.rollback",
                    conversation_id = %conversation.id,
                    turn = turn.index,
                    "deep ambiguity, reusing previous verified entities"
                );
                entities = previous.verified_entities();
            }
        }
        if let Some(first) = entities.first() {
            state.current_table = Some(first.table.clone());
        }
        state.entities = entities.clone();

        let mut act = prediction.act;
        if prediction.confidence < GENERAL_AMBIGUITY_THRESHOLD {
            match conversation.flows.active(false) {
                Some(active) if active.flow_type != FlowType::Chat && !entities.is_empty() => {
                    act = active.act;
                }
                _ => {
                    state.ambiguity.declare(AmbiguityDeclaration::new(AmbiguityLevel::General));
                    self.finish(conversation, state, &audit);
                    return Ok(tracked);
                }
            }
        }

        let Some(flow_type) = FlowType::for_act(act) else {
            tracing::info!(
                event_name = "dst.act.unknown",
                conversation_id = %conversation.id,
                act = %act,
                "act has no flow"
            );
            state.act = ActCode::UNSUPPORTED;
            state.intent = ActCode::UNSUPPORTED.intent();
            self.finish(conversation, state, &audit);
            return Ok(TrackedTurn { act: ActCode::UNSUPPORTED, ..tracked });
        };

        self.select_flow(&mut conversation.flows, flow_type, act, &audit)?;
        if let Some(flow) = conversation.flows.active_mut(false) {
            flow.fill_entities(&entities, state.current_table.as_deref());
            for (name, value) in &prediction.slots {
                flow.fill_slot(name, value);
            }
            if let Some(Slot::FreeText(operation)) = flow.slot_mut("operation") {
                if !operation.is_filled() {
                    operation.add_one(turn.text.as_str());
                }
            }
        }

        self.finish(conversation, state, &audit);
        Ok(tracked)
    }

    async fn apply_action(
        &self,
        flows: &mut FlowStack,
        action: &TurnAction,
        state: &mut DialogueState,
        audit: &AuditContext,
    ) -> Result<(), DomainError> {
        match action {
            TurnAction::Confirm if flows.is_interjected() => {
                let flow = flows.accept_interjection()?;
                self.emit(audit, "flow.interjection_accepted", flow.flow_type);
            }
            TurnAction::Confirm => {
                if let Some(flow) = flows.active_mut(false) {
                    flow.entities_mut().verify_all();
                }
            }
            TurnAction::Reject if flows.is_interjected() => {
                let flow = flows.reject_interjection()?;
                self.emit(audit, "flow.interjection_rejected", flow.flow_type);
            }
            TurnAction::Reject => {
                if let Some(flow) = flows.active_mut(false) {
                    flow.entities_mut().drop_unverified();
                }
            }
            TurnAction::SelectEntities { entities } => {
                let validated = self
                    .validator
                    .validate(entities.clone(), &self.catalog, state.current_table.as_deref(), &mut state.ambiguity)
                    .await;
                if let Some(first) = validated.first() {
                    state.current_table = Some(first.table.clone());
                }
                if let Some(flow) = flows.active_mut(false) {
                    flow.fill_entities(&validated, state.current_table.as_deref());
                }
            }
            TurnAction::AdvanceStage { stage } => {
                if let Some(flow) = flows.active_mut(false) {
                    flow.set_stage(stage)?;
                }
            }
            TurnAction::CheckStep { name } => {
                if let Some(Slot::Checklist(steps)) =
                    flows.active_mut(false).and_then(|flow| flow.slot_mut("steps"))
                {
                    steps.check(name);
                }
            }
            TurnAction::Cancel => {
                if let Some(flow) = flows.pop() {
                    self.emit(audit, "flow.cancelled", flow.flow_type);
                }
            }
        }
        Ok(())
    }

    /// Continues a compatible flow; otherwise substitutes the fallback or
    /// replaces the active flow with a new one. A pending interjection is
    /// declined when the turn continues the flow it interrupted.
    fn select_flow(
        &self,
        flows: &mut FlowStack,
        flow_type: FlowType,
        act: ActCode,
        audit: &AuditContext,
    ) -> Result<(), DomainError> {
        if let Some(top) = flows.active(true).filter(|flow| flow.interjected) {
            let (top_type, top_fallback) = (top.flow_type, top.fallback);
            let beneath = flows.active(false).map(|flow| flow.flow_type);
            if top_type == flow_type {
                flows.accept_interjection()?;
                return Ok(());
            }
            // A turn that matches the interrupted flow resumes it.
            if top_fallback == Some(flow_type) && beneath != Some(flow_type) {
                let replaced = flows.substitute_fallback()?;
                self.emit(audit, "flow.substituted", replaced.flow_type);
                return Ok(());
            }
            if flow_type == FlowType::Chat {
                return Ok(());
            }
            flows.reject_interjection()?;
        }

        let active = flows.active(false).map(|flow| (flow.flow_type, flow.fallback));
        match active {
            Some((active_type, _)) if active_type == flow_type => {
                if let Some(flow) = flows.active_mut(false) {
                    flow.is_newborn = false;
                }
            }
            Some((active_type, _)) if flow_type == FlowType::Chat && active_type != FlowType::Chat => {}
            Some((_, Some(fallback))) if fallback == flow_type => {
                let replaced = flows.substitute_fallback()?;
                self.emit(audit, "flow.substituted", replaced.flow_type);
            }
            Some(_) => {
                if let Some(mut replaced) = flows.pop() {
                    replaced.invalid = true;
                    self.emit(audit, "flow.replaced", replaced.flow_type);
                }
                flows.push_flow(flow_type.build(act));
                self.emit(audit, "flow.pushed", flow_type);
            }
            None => {
                flows.push_flow(flow_type.build(act));
                self.emit(audit, "flow.pushed", flow_type);
            }
        }
        Ok(())
    }

    /// Slot checks, issue detection, flags and commit.
    fn finish(&self, conversation: &mut Conversation, mut state: DialogueState, audit: &AuditContext) {
        if let Some(flow) = conversation.flows.active(false).filter(|flow| flow.flow_type != FlowType::Chat) {
            if let Some(slot) = flow.missing_slots().into_iter().next() {
                state.ambiguity.declare(
                    AmbiguityDeclaration::new(AmbiguityLevel::Specific).for_flow(flow.flow_type).for_slot(slot),
                );
            }
        }

        if !state.flags.has_issues && !state.act.is_unsupported() {
            if let Some(table) = state.current_table.clone() {
                let issues = self.detector.detect(&table, &self.catalog);
                if !issues.is_empty() {
                    self.interject_issues(&mut conversation.flows, &mut state, &table, &issues, audit);
                }
            }
        }

        let active_type = conversation.flows.active(false).map(|flow| flow.flow_type);
        state.flags.has_plan = active_type == Some(FlowType::Plan);
        state.flags.keep_going = conversation.flows.iter().filter(|flow| !flow.completed).count() > 1;

        if state.ambiguity.present() {
            let levels = state
                .ambiguity
                .active_levels()
                .iter()
                .map(|level| level.as_str())
                .collect::<Vec<_>>()
                .join(",");
            self.audit.emit(
                audit
                    .event("ambiguity.declared", AuditCategory::Ambiguity, AuditOutcome::Success)
                    .with_metadata("levels", levels),
            );
        }

        tracing::info!(
            event_name = "dst.state.committed",
            conversation_id = %conversation.id,
            turn = state.turn_index,
            act = %state.act,
            confidence = state.confidence,
            entities = state.entities.len(),
            flows = conversation.flows.len(),
        );
        conversation.states.commit(state);
    }

    fn interject_issues(
        &self,
        flows: &mut FlowStack,
        state: &mut DialogueState,
        table: &str,
        issues: &[DataIssue],
        audit: &AuditContext,
    ) {
        let mut flow = FlowType::ResolveIssues.build(FlowType::ResolveIssues.canonical_act());
        let columns = issues
            .iter()
            .map(|issue| Entity::new(issue.table.clone(), issue.column.clone()).verified())
            .collect::<Vec<_>>();
        flow.fill_entities(&columns, Some(table));
        let worst = issues.iter().map(|issue| issue.severity).fold(0.0, f64::max);
        flow.fill_slot("severity", &serde_json::json!(worst));
        flows.interject(flow);
        self.emit(audit, "flow.interjected", FlowType::ResolveIssues);

        let described = issues
            .iter()
            .map(|issue| {
                let kind = format!("{:?}", issue.kind).to_lowercase();
                format!("{} {kind} values in {}", issue.rows, issue.column)
            })
            .collect::<Vec<_>>()
            .join(", ");
        state.flags.has_issues = true;
        state.ambiguity.set_observation(format!(
            "I noticed possible data issues in {table}: {described}. Should I look into them first?"
        ));
    }

    fn emit(&self, audit: &AuditContext, event_type: &str, flow_type: FlowType) {
        tracing::debug!(
            event_name = event_type,
            conversation_id = %audit.conversation_id,
            turn = audit.turn_index,
            flow_type = flow_type.as_str(),
        );
        self.audit.emit(
            audit
                .event(event_type, AuditCategory::Flow, AuditOutcome::Success)
                .with_metadata("flow_type", flow_type.as_str()),
        );
    }
}

fn carry_over(mut state: DialogueState, previous: Option<&DialogueState>) -> DialogueState {
    if let Some(previous) = previous {
        state.current_table = previous.current_table.clone();
        state.flags.has_issues = previous.flags.has_issues;
        state.flags.has_staging = previous.flags.has_staging;
    }
    state
}

fn active_entities(flows: &FlowStack) -> Vec<Entity> {
    flows.active(false).map(|flow| flow.entities().members().to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tabula_core::audit::InMemoryAuditSink;
    use tabula_core::{
        ActCode, AmbiguityLevel, Conversation, DataIssue, Entity, FlowType, IssueDetector,
        IssueKind, SchemaCatalog, Speaker, TurnAction,
    };

    use super::DialogueStateTracker;
    use crate::entities::EntityValidator;
    use crate::nlu::{PatternMatcher, ReasonerPredictor, UnderstandingEnsemble};
    use crate::testing::{sample_catalog, ScriptedLlm};

    struct OrdersHaveGaps;

    impl IssueDetector for OrdersHaveGaps {
        fn detect(&self, table: &str, _catalog: &SchemaCatalog) -> Vec<DataIssue> {
            if table != "orders" {
                return Vec::new();
            }
            vec![DataIssue {
                table: "orders".to_string(),
                column: "Region".to_string(),
                kind: IssueKind::Missing,
                rows: 4,
                severity: 0.1,
            }]
        }
    }

    fn tracker() -> DialogueStateTracker {
        DialogueStateTracker::new(
            UnderstandingEnsemble::new(PatternMatcher::new()),
            EntityValidator::default(),
            Arc::new(sample_catalog()),
        )
    }

    async fn say(tracker: &DialogueStateTracker, conversation: &mut Conversation, text: &str) {
        conversation.history.push(Speaker::User, text, None);
        tracker.track(conversation, "corr-test").await.expect("tracked");
    }

    async fn act(tracker: &DialogueStateTracker, conversation: &mut Conversation, action: TurnAction) {
        conversation.history.push(Speaker::User, "", Some(action));
        tracker.track(conversation, "corr-test").await.expect("tracked");
    }

    #[tokio::test]
    async fn query_pushes_flow_with_verified_entities() {
        let audit = InMemoryAuditSink::default();
        let tracker = tracker().with_audit(Arc::new(audit.clone()));
        let mut conversation = Conversation::new();

        say(&tracker, &mut conversation, "show the Total in orders").await;

        let state = conversation.states.current().expect("state");
        assert_eq!(state.act, ActCode::QUERY);
        assert_eq!(state.current_table.as_deref(), Some("orders"));
        assert!(!state.ambiguity.present());
        let flow = conversation.flows.active(false).expect("query flow");
        assert_eq!(flow.flow_type, FlowType::Query);
        assert!(flow.is_verified());
        assert_eq!(audit.event_types(), vec!["flow.pushed"]);
    }

    #[tokio::test]
    async fn fuzzy_selection_waits_for_confirmation() {
        let tracker = tracker();
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "show Total").await;

        act(
            &tracker,
            &mut conversation,
            TurnAction::SelectEntities { entities: vec![Entity::new("ordrs", "Date")] },
        )
        .await;
        let state = conversation.states.current().expect("state");
        assert_eq!(state.act, ActCode::QUERY);
        assert!(state.ambiguity.is_active(AmbiguityLevel::Confirmation));
        assert!(!conversation.flows.active(false).expect("flow").is_verified());

        say(&tracker, &mut conversation, "yes").await;
        let state = conversation.states.current().expect("state");
        assert!(!state.ambiguity.present());
        let flow = conversation.flows.active(false).expect("flow");
        assert_eq!(flow.entities().len(), 2);
        assert!(flow.is_verified());
    }

    #[tokio::test]
    async fn unintelligible_turn_is_general_ambiguity() {
        let tracker = tracker();
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "lorem ipsum").await;

        let state = conversation.states.current().expect("state");
        assert_eq!(state.ambiguity.lowest_level(true), Some(AmbiguityLevel::General));
        assert!(conversation.flows.is_empty());
    }

    #[tokio::test]
    async fn denylisted_act_opens_no_flow() {
        let tracker = tracker();
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "/act 07A").await;

        assert_eq!(conversation.states.current().map(|state| state.act), Some(ActCode::UNSUPPORTED));
        assert!(conversation.flows.is_empty());
    }

    #[tokio::test]
    async fn missing_required_slot_is_specific() {
        let tracker = tracker();
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "draw a chart").await;

        let state = conversation.states.current().expect("state");
        let context = state.ambiguity.context(AmbiguityLevel::Specific).expect("specific");
        assert_eq!(context.flow, Some(FlowType::Plot));
        assert_eq!(context.slot.as_deref(), Some("source"));
    }

    #[tokio::test]
    async fn detected_issues_interject_once() {
        let audit = InMemoryAuditSink::default();
        let tracker = tracker().with_detector(Arc::new(OrdersHaveGaps)).with_audit(Arc::new(audit.clone()));
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "show Total").await;

        let state = conversation.states.current().expect("state");
        assert!(state.flags.has_issues);
        assert!(state.ambiguity.observation().is_some_and(|text| text.contains("Region")));
        assert!(conversation.flows.is_interjected());
        assert_eq!(conversation.flows.active(false).map(|flow| flow.flow_type), Some(FlowType::Query));
        assert_eq!(audit.event_types(), vec!["flow.pushed", "flow.interjected"]);

        act(&tracker, &mut conversation, TurnAction::Reject).await;
        assert!(!conversation.flows.is_interjected());
        assert!(conversation.states.current().is_some_and(|state| state.flags.has_issues));
        assert_eq!(conversation.flows.len(), 1);
    }

    #[tokio::test]
    async fn matching_turn_declines_interjection_and_resumes_flow() {
        let tracker = tracker().with_detector(Arc::new(OrdersHaveGaps));
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "show the Total in orders").await;
        assert!(conversation.flows.is_interjected());
        let original = conversation.flows.active(false).map(|flow| flow.id.clone()).expect("query flow");

        say(&tracker, &mut conversation, "show the Date in orders").await;

        assert!(!conversation.flows.is_interjected());
        assert_eq!(conversation.flows.len(), 1);
        let flow = conversation.flows.active(false).expect("query flow");
        assert_eq!(flow.flow_type, FlowType::Query);
        assert_eq!(flow.id, original);
        let columns = flow.entities().members().iter().map(|entity| entity.column.as_str()).collect::<Vec<_>>();
        assert!(columns.contains(&"Total"));
        assert!(!columns.contains(&"Region"));
    }

    #[tokio::test]
    async fn deep_ambiguity_rolls_back_to_verified_entities() {
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"dacts": ["plot"], "entities": [{"table": "orders", "column": "Margn"}], "slots": {"chart": "bar"}}"#,
        ]));
        let tracker = DialogueStateTracker::new(
            UnderstandingEnsemble::new(PatternMatcher::new())
                .with_reasoner(Arc::new(ReasonerPredictor::new(llm, Duration::from_secs(1), 128))),
            EntityValidator::default(),
            Arc::new(sample_catalog()),
        );
        let mut conversation = Conversation::new();
        say(&tracker, &mut conversation, "/sql SELECT Total FROM orders").await;
        act(
            &tracker,
            &mut conversation,
            TurnAction::SelectEntities { entities: vec![Entity::new("orders", "Total")] },
        )
        .await;

        say(&tracker, &mut conversation, "draw it for margn").await;
        let state = conversation.states.current().expect("state");
        assert!(state.ambiguity.is_active(AmbiguityLevel::Partial));
        assert_eq!(state.entities, vec![Entity::new("orders", "Total").verified()]);
    }
}
