//! Model-backed predictors. Both ask the model for act tokens and share
//! the same response parsing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tabula_core::{Entity, WILDCARD_COLUMN};

use super::{validate_dacts, ActPredictor, Prediction, PredictionSource, UnderstandingContext};
use crate::llm::{complete_within, CompletionOptions, LlmClient};
use crate::prompts;

#[derive(Debug, Default, Deserialize)]
struct RawEntity {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    row: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    dacts: Vec<String>,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    slots: BTreeMap<String, serde_json::Value>,
}

/// Parsed model answer before act normalisation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelVerdict {
    pub tokens: Vec<String>,
    pub entities: Vec<Entity>,
    pub thought: Option<String>,
    pub confidence: Option<f64>,
    pub slots: BTreeMap<String, serde_json::Value>,
}

impl ModelVerdict {
    fn into_prediction(self, source: PredictionSource) -> Prediction {
        let (act, confidence) = validate_dacts(&self.tokens, self.confidence);
        let mut prediction = Prediction::new(act, confidence, source).with_entities(self.entities);
        prediction.thought = self.thought.filter(|thought| !thought.trim().is_empty());
        prediction.slots = self.slots;
        prediction
    }
}

/// Reads a JSON object anywhere in the response; otherwise treats the
/// whole text as a comma or whitespace separated token list.
pub fn parse_model_response(text: &str) -> ModelVerdict {
    let object = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    if let Some(raw) = object.and_then(|object| serde_json::from_str::<RawVerdict>(object).ok()) {
        return ModelVerdict {
            tokens: raw.dacts.iter().flat_map(|dact| split_tokens(dact)).collect(),
            entities: raw
                .entities
                .into_iter()
                .filter(|entity| entity.table.is_some() || entity.column.is_some())
                .map(|entity| {
                    let mut resolved = Entity::new(
                        entity.table.unwrap_or_default(),
                        entity.column.unwrap_or_else(|| WILDCARD_COLUMN.to_string()),
                    );
                    resolved.row = entity.row;
                    resolved
                })
                .collect(),
            thought: raw.thought,
            confidence: raw.confidence,
            slots: raw.slots,
        };
    }

    ModelVerdict { tokens: split_tokens(text), ..ModelVerdict::default() }
}

fn split_tokens(text: &str) -> Vec<String> {
    text.split(|character: char| character == ',' || character == '+' || character.is_whitespace())
        .map(|token| token.trim_matches(|character: char| !character.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Single-shot act classification.
pub struct ClassifierPredictor {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl ClassifierPredictor {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl ActPredictor for ClassifierPredictor {
    fn name(&self) -> &'static str {
        PredictionSource::Classifier.as_str()
    }

    async fn predict(&self, context: &UnderstandingContext<'_>) -> Result<Prediction> {
        let prompt = prompts::classifier_prompt(context);
        let options = CompletionOptions::default().with_max_tokens(64);
        let response = complete_within(self.llm.as_ref(), &prompt, &options, self.timeout).await?;
        Ok(parse_model_response(&response).into_prediction(PredictionSource::Classifier))
    }
}

/// In-context reasoner; sees the cheaper predictions as priors and streams
/// its thought. A stream cut off at the deadline is parsed as far as it got.
pub struct ReasonerPredictor {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    max_tokens: u32,
}

impl ReasonerPredictor {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration, max_tokens: u32) -> Self {
        Self { llm, timeout, max_tokens }
    }
}

#[async_trait]
impl ActPredictor for ReasonerPredictor {
    fn name(&self) -> &'static str {
        PredictionSource::Reasoner.as_str()
    }

    async fn predict(&self, context: &UnderstandingContext<'_>) -> Result<Prediction> {
        let prompt = prompts::reasoner_prompt(context);
        let options = CompletionOptions::default().with_max_tokens(self.max_tokens);
        let stream = tokio::time::timeout(self.timeout, self.llm.stream(&prompt, &options))
            .await
            .map_err(|_| anyhow::anyhow!("reasoner timed out after {}s", self.timeout.as_secs()))??;
        let text = stream.collect_partial(self.timeout).await;
        Ok(parse_model_response(&text).into_prediction(PredictionSource::Reasoner))
    }
}
