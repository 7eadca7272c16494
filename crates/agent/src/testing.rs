//! Scripted backends shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tabula_core::{CodeDialect, DataStore, SchemaCatalog, StoreError, TabularResult};

use crate::llm::{CompletionOptions, LlmClient};

/// Replies with queued responses in order; errors once the script runs out.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    budgets: Mutex<Vec<u32>>,
    always_fail: bool,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|response| Ok(response.into())))
    }

    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self { responses: Mutex::new(results.into_iter().collect()), ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { always_fail: true, ..Self::default() }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt log").clone()
    }

    pub fn budgets(&self) -> Vec<u32> {
        self.budgets.lock().expect("budget log").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        self.prompts.lock().expect("prompt log").push(prompt.to_string());
        self.budgets.lock().expect("budget log").push(options.max_tokens);
        if self.always_fail {
            return Err(anyhow!("model backend unreachable"));
        }
        match self.responses.lock().expect("script").pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("script exhausted")),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Returns queued outcomes in order and records every executed code string.
#[derive(Default)]
pub struct ScriptedStore {
    outcomes: Mutex<VecDeque<Result<TabularResult, StoreError>>>,
    executed: Mutex<Vec<(String, CodeDialect)>>,
}

impl ScriptedStore {
    pub fn new<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Result<TabularResult, StoreError>>,
    {
        Self { outcomes: Mutex::new(outcomes.into_iter().collect()), ..Self::default() }
    }

    pub fn executed(&self) -> Vec<(String, CodeDialect)> {
        self.executed.lock().expect("execution log").clone()
    }
}

#[async_trait]
impl DataStore for ScriptedStore {
    async fn execute(&self, code: &str, dialect: CodeDialect) -> Result<TabularResult, StoreError> {
        self.executed.lock().expect("execution log").push((code.to_string(), dialect));
        self.outcomes.lock().expect("outcomes").pop_front().unwrap_or_else(|| Ok(TabularResult::default()))
    }
}

pub fn sample_catalog() -> SchemaCatalog {
    SchemaCatalog::from_columns([
        ("orders", vec!["Total", "Date", "Region", "Customer Name"]),
        ("returns", vec!["Date", "Reason"]),
    ])
}

pub fn table(columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> TabularResult {
    TabularResult {
        columns: columns.iter().map(|column| column.to_string()).collect(),
        rows,
        rows_affected: 0,
    }
}
