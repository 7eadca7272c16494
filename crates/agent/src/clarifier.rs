//! Words the clarifying question for the most severe open ambiguity.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tabula_core::{
    AmbiguityContext, AmbiguityLedger, AmbiguityLevel, Clarification, ClarificationRequest,
    ClarificationTemplates, DefaultTemplates, FlowStack,
};

use crate::llm::{complete_within, CompletionOptions, LlmClient};
use crate::prompts;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClarifyingQuestion {
    /// `None` for an observation the engine raised itself.
    pub level: Option<AmbiguityLevel>,
    pub text: String,
}

pub struct Clarifier {
    templates: Arc<dyn ClarificationTemplates>,
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl Default for Clarifier {
    fn default() -> Self {
        Self::new(Arc::new(DefaultTemplates))
    }
}

impl Clarifier {
    pub fn new(templates: Arc<dyn ClarificationTemplates>) -> Self {
        Self { templates, llm: None, timeout: Duration::from_secs(30) }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.timeout = timeout;
        self
    }

    pub async fn clarify(
        &self,
        ledger: &mut AmbiguityLedger,
        flows: &mut FlowStack,
        transcript: &str,
    ) -> Option<ClarifyingQuestion> {
        match ledger.ask(flows, self.templates.as_ref())? {
            Clarification::Observation { text } => Some(ClarifyingQuestion { level: None, text }),
            Clarification::Templated { level, text } => Some(ClarifyingQuestion { level: Some(level), text }),
            Clarification::Generate(request) => {
                let text = match self.generate(&request, transcript).await {
                    Some(text) => text,
                    None => self.templates.render(
                        flows.active(true),
                        request.level,
                        &AmbiguityContext {
                            flow: request.flow,
                            slot: request.slot.clone(),
                            values: request.values.clone(),
                        },
                    ),
                };
                Some(ClarifyingQuestion { level: Some(request.level), text })
            }
        }
    }

    async fn generate(&self, request: &ClarificationRequest, transcript: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let prompt = prompts::clarification_prompt(request, transcript);
        let options = CompletionOptions::default().with_max_tokens(128);
        match complete_within(llm.as_ref(), &prompt, &options, self.timeout).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(
                    event_name = "clarifier.generate.failed",
                    level = %request.level,
                    error = %error,
                    "falling back to template"
                );
                None
            }
        }
    }
}
