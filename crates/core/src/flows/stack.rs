use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::act::{ActCode, Intent};
use crate::entity::Entity;
use crate::flows::catalog::FlowType;
use crate::flows::flow::Flow;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowStackError {
    #[error("flow stack is empty")]
    Empty,
    #[error("top of the flow stack is not an interjection")]
    NotInterjected,
    #[error("flow {0:?} has no fallback")]
    NoFallback(FlowType),
}

/// Ordered task stack; the last element is the active flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStack {
    flows: Vec<Flow>,
}

impl FlowStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.iter()
    }

    pub fn push(
        &mut self,
        flow_type: FlowType,
        act: ActCode,
        intent: Intent,
        entities: &[Entity],
    ) -> &mut Flow {
        let mut flow = flow_type.build(act);
        flow.intent = intent;
        flow.fill_entities(entities, None);
        self.push_flow(flow)
    }

    pub fn push_flow(&mut self, flow: Flow) -> &mut Flow {
        self.flows.push(flow);
        let last = self.flows.len() - 1;
        &mut self.flows[last]
    }

    pub fn pop(&mut self) -> Option<Flow> {
        self.flows.pop()
    }

    fn active_index(&self, allow_interject: bool) -> Option<usize> {
        if allow_interject {
            return self.flows.len().checked_sub(1);
        }
        self.flows.iter().rposition(|flow| !flow.interjected)
    }

    /// Active flow. With `allow_interject = false`, interjected flows on top
    /// are skipped so slot filling reaches the interrupted flow.
    pub fn active(&self, allow_interject: bool) -> Option<&Flow> {
        self.active_index(allow_interject).map(|index| &self.flows[index])
    }

    pub fn active_mut(&mut self, allow_interject: bool) -> Option<&mut Flow> {
        self.active_index(allow_interject).map(move |index| &mut self.flows[index])
    }

    pub fn find_by_type(&self, flow_type: FlowType) -> Option<&Flow> {
        self.flows.iter().rev().find(|flow| flow.flow_type == flow_type)
    }

    pub fn find_by_type_mut(&mut self, flow_type: FlowType) -> Option<&mut Flow> {
        self.flows.iter_mut().rev().find(|flow| flow.flow_type == flow_type)
    }

    /// Places an agent-initiated flow above the current one.
    pub fn interject(&mut self, mut flow: Flow) -> &mut Flow {
        flow.interjected = true;
        self.push_flow(flow)
    }

    pub fn is_interjected(&self) -> bool {
        self.flows.last().is_some_and(|flow| flow.interjected)
    }

    /// Promotes the interjection to a regular flow.
    pub fn accept_interjection(&mut self) -> Result<&mut Flow, FlowStackError> {
        match self.flows.last_mut() {
            Some(flow) if flow.interjected => {
                flow.interjected = false;
                Ok(flow)
            }
            Some(_) => Err(FlowStackError::NotInterjected),
            None => Err(FlowStackError::Empty),
        }
    }

    /// Drops the interjection; the interrupted flow is left as it was.
    pub fn reject_interjection(&mut self) -> Result<Flow, FlowStackError> {
        match self.flows.last() {
            Some(flow) if flow.interjected => self.flows.pop().ok_or(FlowStackError::Empty),
            Some(_) => Err(FlowStackError::NotInterjected),
            None => Err(FlowStackError::Empty),
        }
    }

    /// Replaces the active flow with its fallback. The old flow is returned
    /// marked invalid; its entities carry over to the replacement.
    pub fn substitute_fallback(&mut self) -> Result<Flow, FlowStackError> {
        let mut current = self.flows.pop().ok_or(FlowStackError::Empty)?;
        let Some(fallback) = current.fallback else {
            let flow_type = current.flow_type;
            self.flows.push(current);
            return Err(FlowStackError::NoFallback(flow_type));
        };

        let mut replacement = fallback.build(fallback.canonical_act());
        replacement.fill_entities(current.entities().members(), None);
        replacement.is_newborn = false;
        current.invalid = true;
        self.flows.push(replacement);
        Ok(current)
    }

    /// Removes completed and invalid flows from the top of the stack.
    pub fn pop_completed(&mut self) -> Vec<Flow> {
        let mut removed = Vec::new();
        while self.flows.last().is_some_and(|flow| flow.completed || flow.invalid) {
            if let Some(flow) = self.flows.pop() {
                removed.push(flow);
            }
        }
        removed
    }
}
