use std::sync::Arc;

use super::{ActPredictor, PatternMatcher, Prediction, UnderstandingContext};

pub const DEFAULT_OVERRIDE_THRESHOLD: f64 = 0.9;

/// Arbitrates between the predictors for one turn.
///
/// A fully confident pattern (slash command) answers without any model call,
/// and so does one above the override threshold. Otherwise the reasoner is
/// authoritative with the cheaper results as priors; the classifier stands
/// in when the reasoner fails, and the better of retriever and pattern when
/// both fail. Denylisted acts always come out as the unsupported sentinel.
pub struct UnderstandingEnsemble {
    pattern: PatternMatcher,
    retriever: Option<Arc<dyn ActPredictor>>,
    classifier: Option<Arc<dyn ActPredictor>>,
    reasoner: Option<Arc<dyn ActPredictor>>,
    override_threshold: f64,
}

impl Default for UnderstandingEnsemble {
    fn default() -> Self {
        Self::new(PatternMatcher::new())
    }
}

impl UnderstandingEnsemble {
    pub fn new(pattern: PatternMatcher) -> Self {
        Self {
            pattern,
            retriever: None,
            classifier: None,
            reasoner: None,
            override_threshold: DEFAULT_OVERRIDE_THRESHOLD,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ActPredictor>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ActPredictor>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn ActPredictor>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_override_threshold(mut self, threshold: f64) -> Self {
        self.override_threshold = threshold;
        self
    }

    pub async fn understand(&self, context: &UnderstandingContext<'_>) -> Prediction {
        let pattern = self.pattern.match_text(
            context.last_user_text(),
            context.catalog,
            context.current_table,
        );
        if pattern.confidence >= 1.0 || pattern.confidence > self.override_threshold {
            return finish(pattern, None);
        }

        let retrieved = match &self.retriever {
            Some(retriever) => attempt(retriever.as_ref(), context).await,
            None => None,
        };

        let mut priors = vec![pattern.clone()];
        priors.extend(retrieved.iter().cloned());
        let primed = context.with_priors(&priors);

        for predictor in [&self.reasoner, &self.classifier].into_iter().flatten() {
            if let Some(prediction) = attempt(predictor.as_ref(), &primed).await {
                return finish(prediction, Some(&pattern));
            }
        }

        let chosen = match retrieved {
            Some(retrieved) if retrieved.confidence > pattern.confidence => retrieved,
            _ => pattern.clone(),
        };
        finish(chosen, Some(&pattern))
    }
}

async fn attempt(predictor: &dyn ActPredictor, context: &UnderstandingContext<'_>) -> Option<Prediction> {
    match predictor.predict(context).await {
        Ok(prediction) => Some(prediction),
        Err(error) => {
            tracing::warn!(
                event_name = "nlu.predictor.failed",
                predictor = predictor.name(),
                error = %error,
                "predictor failed, falling back"
            );
            None
        }
    }
}

/// Backfills entities and slots the pattern already found, then screens.
fn finish(mut prediction: Prediction, pattern: Option<&Prediction>) -> Prediction {
    if let Some(pattern) = pattern {
        if prediction.entities.is_empty() {
            prediction.entities = pattern.entities.clone();
        }
        if prediction.act == pattern.act {
            for (name, value) in &pattern.slots {
                prediction.slots.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    if prediction.act.is_unsupported() {
        tracing::info!(
            event_name = "nlu.act.unsupported",
            act = %prediction.act,
            source = prediction.source.as_str(),
            "denylisted act screened"
        );
        let screened = prediction.act.screened();
        prediction = prediction.with_act(screened);
    }

    tracing::debug!(
        event_name = "nlu.understood",
        act = %prediction.act,
        intent = %prediction.intent,
        confidence = prediction.confidence,
        source = prediction.source.as_str(),
    );
    prediction
}
