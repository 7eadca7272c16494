//! Utterance understanding: several predictors map the recent history to
//! an act code, and the ensemble arbitrates between them.

pub mod ensemble;
pub mod model;
pub mod pattern;
pub mod retriever;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabula_core::{ActCode, ActToken, CodeDialect, Entity, Intent, SchemaCatalog, Speaker, Turn};

pub use ensemble::UnderstandingEnsemble;
pub use model::{ClassifierPredictor, ReasonerPredictor};
pub use pattern::PatternMatcher;
pub use retriever::{Embedder, Exemplar, HashingEmbedder, NearestNeighborRetriever};

/// Confidence assigned to a normalised token list when the model gave none.
pub const DEFAULT_MODEL_CONFIDENCE: f64 = 0.7;
/// Confidence for an empty or implausibly long token list.
pub const LOW_CONFIDENCE: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Pattern,
    Retriever,
    Classifier,
    Reasoner,
}

impl PredictionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Retriever => "retriever",
            Self::Classifier => "classifier",
            Self::Reasoner => "reasoner",
        }
    }
}

/// Code typed directly by the user through a slash command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCode {
    pub dialect: CodeDialect,
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub intent: Intent,
    pub act: ActCode,
    pub confidence: f64,
    pub entities: Vec<Entity>,
    pub thought: Option<String>,
    pub payload: Option<RawCode>,
    /// Non-entity slot values keyed by slot name.
    pub slots: BTreeMap<String, serde_json::Value>,
    pub source: PredictionSource,
}

impl Prediction {
    pub fn new(act: ActCode, confidence: f64, source: PredictionSource) -> Self {
        Self {
            intent: act.intent(),
            act,
            confidence: confidence.clamp(0.0, 1.0),
            entities: Vec::new(),
            thought: None,
            payload: None,
            slots: BTreeMap::new(),
            source,
        }
    }

    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_slot(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.slots.insert(name.into(), value);
        self
    }

    pub fn with_payload(mut self, dialect: CodeDialect, code: impl Into<String>) -> Self {
        self.payload = Some(RawCode { dialect, code: code.into() });
        self
    }

    /// Re-keys the prediction to a different act, keeping the intent in step.
    pub fn with_act(mut self, act: ActCode) -> Self {
        self.act = act;
        self.intent = act.intent();
        self
    }
}

/// What a predictor may look at for one turn.
#[derive(Clone, Copy, Debug)]
pub struct UnderstandingContext<'a> {
    pub history: &'a [Turn],
    pub catalog: &'a SchemaCatalog,
    pub current_table: Option<&'a str>,
    /// Earlier, cheaper predictions offered as hints.
    pub priors: &'a [Prediction],
}

impl<'a> UnderstandingContext<'a> {
    pub fn new(history: &'a [Turn], catalog: &'a SchemaCatalog) -> Self {
        Self { history, catalog, current_table: None, priors: &[] }
    }

    pub fn with_current_table(mut self, table: Option<&'a str>) -> Self {
        self.current_table = table;
        self
    }

    pub fn with_priors(mut self, priors: &'a [Prediction]) -> Self {
        self.priors = priors;
        self
    }

    pub fn last_user_text(&self) -> &'a str {
        self.history
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::User)
            .map(|turn| turn.text.as_str())
            .unwrap_or_default()
    }

    /// The last `count` user utterances joined oldest first.
    pub fn recent_user_text(&self, count: usize) -> String {
        let mut texts = self
            .history
            .iter()
            .rev()
            .filter(|turn| turn.speaker == Speaker::User)
            .take(count)
            .map(|turn| turn.text.as_str())
            .collect::<Vec<_>>();
        texts.reverse();
        texts.join(" ")
    }

    pub fn transcript(&self) -> String {
        self.history
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

#[async_trait]
pub trait ActPredictor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn predict(&self, context: &UnderstandingContext<'_>) -> Result<Prediction>;
}

/// Maps raw act-token names to a canonical code and a confidence.
///
/// Unknown names are dropped. An empty list falls back to chat; a raw list
/// longer than three names keeps the first three known tokens. Both signal
/// a poor parse and score [`LOW_CONFIDENCE`].
pub fn validate_dacts<S: AsRef<str>>(tokens: &[S], model_confidence: Option<f64>) -> (ActCode, f64) {
    let overlong = tokens.len() > 3;
    let mut parsed: Vec<ActToken> = Vec::new();
    for token in tokens.iter().filter_map(|token| ActToken::parse(token.as_ref())) {
        if !parsed.contains(&token) {
            parsed.push(token);
        }
    }

    if parsed.is_empty() {
        return (ActCode::CHAT, LOW_CONFIDENCE);
    }
    if overlong || parsed.len() > 3 {
        parsed.truncate(3);
        let act = ActCode::from_tokens(&parsed).unwrap_or(ActCode::CHAT);
        return (act, LOW_CONFIDENCE);
    }

    match ActCode::from_tokens(&parsed) {
        Ok(act) => {
            let confidence = model_confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE).clamp(0.0, 1.0);
            (act, confidence)
        }
        Err(_) => (ActCode::CHAT, LOW_CONFIDENCE),
    }
}

#[cfg(test)]
mod tests {
    use tabula_core::ActCode;

    use super::{validate_dacts, LOW_CONFIDENCE};

    #[test]
    fn known_tokens_form_canonical_code() {
        let (act, confidence) = validate_dacts(&["update", "row", "retrieve"], None);
        assert_eq!(act, ActCode::new("46B").expect("code"));
        assert!((confidence - 0.7).abs() < f64::EPSILON);

        let (act, confidence) = validate_dacts(&["Plot"], Some(0.85));
        assert_eq!(act.as_str(), "003");
        assert!((confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_tokens_are_dropped() {
        let (act, _) = validate_dacts(&["query", "banana"], None);
        assert_eq!(act, ActCode::QUERY);
    }

    #[test]
    fn empty_or_long_lists_score_low() {
        let empty: [&str; 0] = [];
        assert_eq!(validate_dacts(&empty, Some(0.99)), (ActCode::CHAT, LOW_CONFIDENCE));
        assert_eq!(validate_dacts(&["nonsense"], None), (ActCode::CHAT, LOW_CONFIDENCE));

        let (act, confidence) = validate_dacts(&["query", "measure", "plot", "retrieve"], Some(0.9));
        assert_eq!(act.as_str(), "123");
        assert!((confidence - LOW_CONFIDENCE).abs() < f64::EPSILON);

        let (act, confidence) = validate_dacts(&["query", "plot", "banana", "measure"], Some(0.9));
        assert_eq!(act.as_str(), "123");
        assert!((confidence - LOW_CONFIDENCE).abs() < f64::EPSILON);
    }
}
