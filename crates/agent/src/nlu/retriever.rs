//! Nearest-neighbour act prediction over a labelled exemplar index.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tabula_core::{ActCode, FlowType};

use super::{ActPredictor, Prediction, PredictionSource, UnderstandingContext};

pub type Embedding = Vec<f32>;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    fn dimension(&self) -> usize;
}

/// Signed feature hashing of lower-cased word unigrams and bigrams.
#[derive(Clone, Copy, Debug)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimension: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let words = text
            .split(|character: char| !character.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .map(str::to_lowercase)
            .collect::<Vec<_>>();
        let bigrams = words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));

        let mut vector = vec![0.0f32; self.dimension];
        for feature in words.iter().cloned().chain(bigrams) {
            let digest = blake3::hash(feature.as_bytes());
            let bytes = digest.as_bytes();
            let index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                % self.dimension;
            let sign = if bytes[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exemplar {
    pub text: String,
    pub act: ActCode,
}

impl Exemplar {
    pub fn new(text: impl Into<String>, act: ActCode) -> Self {
        Self { text: text.into(), act }
    }
}

/// A small built-in index covering every flow family.
pub fn seed_exemplars() -> Vec<Exemplar> {
    let labelled: [(FlowType, &[&str]); 11] = [
        (FlowType::Chat, &["hi there", "thanks a lot", "what can you do", "good morning"]),
        (
            FlowType::Query,
            &[
                "how many orders were placed last month",
                "show me the top customers by revenue",
                "which region has the highest sales",
                "list the rows where status is pending",
            ],
        ),
        (
            FlowType::Measure,
            &["calculate the conversion rate", "what is our average order value", "compute the return rate"],
        ),
        (FlowType::Pivot, &["break down sales by region and month", "group revenue by product category"]),
        (FlowType::Plan, &["analyze why revenue dropped this quarter", "investigate the churn across segments"]),
        (FlowType::Plot, &["plot sales over time", "draw a bar chart of revenue by region", "visualize the distribution"]),
        (
            FlowType::UpdateRows,
            &["change the status of these rows to closed", "replace null prices with zero", "fix the typo in the city names"],
        ),
        (FlowType::Dedupe, &["remove duplicate customers", "dedupe the orders table keeping the newest"]),
        (FlowType::InsertColumn, &["add a column for profit margin", "create a new column with the full name"]),
        (FlowType::DeleteColumn, &["drop the notes column", "remove the unused column"]),
        (FlowType::MergeTables, &["merge the orders and returns tables", "join customers with orders"]),
    ];

    labelled
        .iter()
        .flat_map(|(flow_type, texts)| {
            texts.iter().map(move |text| Exemplar::new(*text, flow_type.canonical_act()))
        })
        .collect()
}

pub struct NearestNeighborRetriever {
    embedder: Arc<dyn Embedder>,
    index: Vec<(Exemplar, Embedding)>,
    k: usize,
}

impl NearestNeighborRetriever {
    pub async fn build(embedder: Arc<dyn Embedder>, exemplars: Vec<Exemplar>, k: usize) -> Result<Self> {
        let mut index = Vec::with_capacity(exemplars.len());
        for exemplar in exemplars {
            let embedding = embedder.embed(&exemplar.text).await?;
            index.push((exemplar, embedding));
        }
        Ok(Self { embedder, index, k: k.max(1) })
    }

    pub async fn seeded(k: usize) -> Result<Self> {
        Self::build(Arc::new(HashingEmbedder::default()), seed_exemplars(), k).await
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Labels of the `k` most similar exemplars, best first.
    pub async fn nearest(&self, text: &str) -> Result<Vec<ActCode>> {
        let query = self.embedder.embed(text).await?;
        let mut scored = self
            .index
            .iter()
            .map(|(exemplar, embedding)| (cosine(&query, embedding), exemplar.act))
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));
        Ok(scored.into_iter().take(self.k).map(|(_, act)| act).collect())
    }
}

fn cosine(left: &[f32], right: &[f32]) -> f64 {
    let dot = left.iter().zip(right).map(|(a, b)| f64::from(*a) * f64::from(*b)).sum::<f64>();
    let left_norm = left.iter().map(|a| f64::from(*a).powi(2)).sum::<f64>().sqrt();
    let right_norm = right.iter().map(|b| f64::from(*b).powi(2)).sum::<f64>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

/// Plurality label, ties going to the label ranked first, with the
/// inverse-entropy uniformity score `min(1, 1 - H / ln k)`.
pub fn vote(labels: &[ActCode]) -> Option<(ActCode, f64)> {
    let first = *labels.first()?;
    let mut counts: HashMap<ActCode, usize> = HashMap::new();
    for label in labels {
        *counts.entry(*label).or_default() += 1;
    }

    let mut winner = first;
    for label in labels {
        if counts[label] > counts[&winner] {
            winner = *label;
        }
    }

    let k = labels.len();
    if k == 1 || counts.len() == 1 {
        return Some((winner, 1.0));
    }
    let entropy = counts
        .values()
        .map(|count| {
            let share = *count as f64 / k as f64;
            -share * share.ln()
        })
        .sum::<f64>();
    Some((winner, (1.0 - entropy / (k as f64).ln()).min(1.0)))
}

#[async_trait]
impl ActPredictor for NearestNeighborRetriever {
    fn name(&self) -> &'static str {
        PredictionSource::Retriever.as_str()
    }

    async fn predict(&self, context: &UnderstandingContext<'_>) -> Result<Prediction> {
        let labels = self.nearest(&context.recent_user_text(2)).await?;
        let (act, confidence) = vote(&labels).ok_or_else(|| anyhow!("exemplar index is empty"))?;
        Ok(Prediction::new(act, confidence, PredictionSource::Retriever))
    }
}
