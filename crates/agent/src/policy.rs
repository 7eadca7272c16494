//! Bounded generate-execute-repair loop around the model and the store.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tabula_core::config::{AppConfig, DialogueConfig, LlmConfig};
use tabula_core::{CodeDialect, DataStore, DialogueState, Flow, TabularResult};

use crate::llm::{complete_within, CompletionOptions, LlmClient};
use crate::prompts;

/// Code reported for any turn that did not produce runnable code.
pub const ERROR_SENTINEL: &str = "error";

const FAILURE_TAIL_LINES: usize = 3;
const FAILURE_TAIL_CHARS: usize = 300;

const DANGLING_KEYWORDS: [&str; 22] = [
    "SELECT", "FROM", "WHERE", "AND", "OR", "JOIN", "ON", "BY", "SET", "VALUES", "AS", "THEN",
    "ELSE", "WHEN", "CASE", "NOT", "IN", "LIKE", "HAVING", "LIMIT", "INTO", "UPDATE",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed { result: TabularResult, code: String },
    /// The model declined the request; no retry was made.
    Rejected { message: String },
    /// The attempt budget ran out.
    Failed { message: String },
}

impl ExecutionOutcome {
    pub fn code(&self) -> &str {
        match self {
            Self::Completed { code, .. } => code,
            Self::Rejected { .. } | Self::Failed { .. } => ERROR_SENTINEL,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Ready { code: String },
    Rejected { message: String },
    Failed { message: String },
}

impl ArtifactOutcome {
    pub fn code(&self) -> &str {
        match self {
            Self::Ready { code } => code,
            Self::Rejected { .. } | Self::Failed { .. } => ERROR_SENTINEL,
        }
    }
}

pub struct PolicyEngine {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn DataStore>,
    max_attempts: u32,
    base_tokens: u32,
    model_timeout: Duration,
    store_timeout: Duration,
    fence: Option<Regex>,
    function_definition: Option<Regex>,
    import: Option<Regex>,
}

impl PolicyEngine {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn DataStore>) -> Self {
        let defaults = AppConfig::default();
        Self::from_config(llm, store, &defaults.dialogue, &defaults.llm)
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn DataStore>,
        dialogue: &DialogueConfig,
        model: &LlmConfig,
    ) -> Self {
        Self {
            llm,
            store,
            max_attempts: dialogue.max_attempts.max(1),
            base_tokens: model.max_tokens,
            model_timeout: Duration::from_secs(model.timeout_secs),
            store_timeout: Duration::from_secs(dialogue.store_timeout_secs),
            fence: Regex::new(r"```[A-Za-z0-9_+-]*[ \t]*\r?\n?([\s\S]*?)```").ok(),
            function_definition: Regex::new(r"(?m)^[ \t]*(?:async[ \t]+)?(?:def|fn|function)[ \t]+\w+[ \t]*\(").ok(),
            import: Regex::new(r"(?m)^[ \t]*(?:import[ \t]|from[ \t]+\S+[ \t]+import[ \t]|use[ \t]+\w+::|require\()").ok(),
        }
    }

    pub fn with_timeouts(mut self, model: Duration, store: Duration) -> Self {
        self.model_timeout = model;
        self.store_timeout = store;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generates and runs code for `flow`, repairing after failures.
    ///
    /// Every execution failure appends one entry to `state.errors`. Truncated
    /// code doubles the token budget and retries the same prompt without an
    /// error entry. An `error` reply from the model ends the loop at once.
    pub async fn execute_with_retries(
        &self,
        state: &mut DialogueState,
        flow: &Flow,
        prompt: &str,
        history: &str,
        preview: &str,
        valid_targets: &[String],
        dialect: CodeDialect,
    ) -> ExecutionOutcome {
        let mut budget = self.base_tokens;
        let mut current_prompt = prompt.to_string();
        let mut last_failure = "no code was generated".to_string();

        for attempt in 1..=self.max_attempts {
            tracing::debug!(
                event_name = "policy.attempt",
                flow_type = flow.flow_type.as_str(),
                attempt,
                max_tokens = budget,
            );
            let options = CompletionOptions::default().with_max_tokens(budget);
            let response =
                match complete_within(self.llm.as_ref(), &current_prompt, &options, self.model_timeout).await {
                    Ok(response) => response,
                    Err(error) => {
                        last_failure = failure_tail(&error.to_string());
                        state.record_error(ERROR_SENTINEL, last_failure.clone());
                        continue;
                    }
                };

            if let Some(message) = error_signal(&response) {
                tracing::info!(
                    event_name = "policy.rejected",
                    flow_type = flow.flow_type.as_str(),
                    attempt,
                    "model declined the request"
                );
                return ExecutionOutcome::Rejected { message };
            }

            let code = self.sanitize(&response, valid_targets);
            if is_incomplete(&code) {
                tracing::debug!(event_name = "policy.incomplete", attempt, max_tokens = budget);
                budget = budget.saturating_mul(2);
                last_failure = "the generated code was cut off".to_string();
                continue;
            }

            let failure = match tokio::time::timeout(self.store_timeout, self.store.execute(&code, dialect)).await {
                Ok(Ok(result)) => {
                    tracing::info!(
                        event_name = "policy.completed",
                        flow_type = flow.flow_type.as_str(),
                        attempt,
                        rows = result.row_count(),
                    );
                    return ExecutionOutcome::Completed { result, code };
                }
                Ok(Err(error)) => error.to_string(),
                Err(_) => format!("execution timed out after {}s", self.store_timeout.as_secs()),
            };

            let tail = failure_tail(&failure);
            tracing::warn!(
                event_name = "policy.execution_failed",
                flow_type = flow.flow_type.as_str(),
                attempt,
                failure = %tail,
            );
            state.record_error(code.clone(), tail.clone());
            current_prompt = prompts::repair_prompt(&code, &tail, &state.summary(), preview, history);
            last_failure = tail;
        }

        tracing::warn!(
            event_name = "policy.exhausted",
            flow_type = flow.flow_type.as_str(),
            attempts = self.max_attempts,
        );
        ExecutionOutcome::Failed { message: last_failure }
    }

    /// Asks for one reusable function without running it. The token budget
    /// grows by a factor of √2 after every rejected attempt.
    pub async fn generate_artifact(
        &self,
        state: &mut DialogueState,
        prompt: &str,
        history: &str,
    ) -> ArtifactOutcome {
        let mut budget = self.base_tokens;
        let mut current_prompt = prompt.to_string();
        let mut last_failure = "no code was generated".to_string();

        for attempt in 1..=self.max_attempts {
            let options = CompletionOptions::default().with_max_tokens(budget);
            budget = ((f64::from(budget)) * std::f64::consts::SQRT_2).round() as u32;

            let response =
                match complete_within(self.llm.as_ref(), &current_prompt, &options, self.model_timeout).await {
                    Ok(response) => response,
                    Err(error) => {
                        last_failure = failure_tail(&error.to_string());
                        state.record_error(ERROR_SENTINEL, last_failure.clone());
                        continue;
                    }
                };
            if let Some(message) = error_signal(&response) {
                return ArtifactOutcome::Rejected { message };
            }

            let code = self.sanitize(&response, &[]);
            match self.artifact_problem(&code) {
                None => return ArtifactOutcome::Ready { code },
                Some(problem) => {
                    tracing::debug!(event_name = "policy.artifact.invalid", attempt, problem);
                    state.record_error(code.clone(), problem);
                    current_prompt =
                        prompts::repair_prompt(&code, problem, &state.summary(), "", history);
                    last_failure = problem.to_string();
                }
            }
        }
        ArtifactOutcome::Failed { message: last_failure }
    }

    /// Runs user-supplied code once, without generation or repair.
    pub async fn execute_code(
        &self,
        state: &mut DialogueState,
        code: &str,
        dialect: CodeDialect,
    ) -> ExecutionOutcome {
        let code = code.trim().to_string();
        let failure = match tokio::time::timeout(self.store_timeout, self.store.execute(&code, dialect)).await {
            Ok(Ok(result)) => return ExecutionOutcome::Completed { result, code },
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("execution timed out after {}s", self.store_timeout.as_secs()),
        };
        let tail = failure_tail(&failure);
        state.record_error(code, tail.clone());
        ExecutionOutcome::Failed { message: tail }
    }

    fn artifact_problem(&self, code: &str) -> Option<&'static str> {
        let definitions = self
            .function_definition
            .as_ref()
            .map(|regex| regex.find_iter(code).count())
            .unwrap_or(0);
        if definitions != 1 {
            return Some("expected exactly one function definition");
        }
        if self.import.as_ref().is_some_and(|regex| regex.is_match(code)) {
            return Some("the function must not import anything");
        }
        None
    }

    /// Extracts code from a fenced block, drops commentary lines around it
    /// and quotes targets whose names need quoting.
    pub fn sanitize(&self, response: &str, valid_targets: &[String]) -> String {
        let fenced = self
            .fence
            .as_ref()
            .and_then(|regex| regex.captures(response))
            .and_then(|captures| captures.get(1))
            .map(|body| body.as_str().to_string());
        let body = match fenced {
            Some(body) => body,
            None => match response.find("```") {
                Some(start) => {
                    let rest = &response[start + 3..];
                    rest.split_once('\n').map(|(_, code)| code.to_string()).unwrap_or_default()
                }
                None => response.to_string(),
            },
        };

        let lines = body.lines().collect::<Vec<_>>();
        let start = lines.iter().position(|line| !is_commentary(line)).unwrap_or(lines.len());
        let end = lines.iter().rposition(|line| !is_commentary(line)).map_or(start, |index| index + 1);
        let code = lines[start..end.max(start)].join("\n").trim().to_string();
        quote_targets(&code, valid_targets)
    }
}

/// Message of an explicit refusal, when the reply starts with `error`.
fn error_signal(response: &str) -> Option<String> {
    let trimmed = response.trim_start();
    if !trimmed.get(..ERROR_SENTINEL.len())?.eq_ignore_ascii_case(ERROR_SENTINEL) {
        return None;
    }
    let message = trimmed[ERROR_SENTINEL.len()..].trim_start_matches([':', ' ', '-']).trim();
    Some(if message.is_empty() {
        "the request cannot be carried out on this data".to_string()
    } else {
        message.to_string()
    })
}

fn is_commentary(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    const OPENERS: [&str; 9] =
        ["here ", "here's", "sure", "certainly", "this ", "the following", "below", "okay", "note:"];
    OPENERS.iter().any(|opener| lowered.starts_with(opener))
        || (trimmed.ends_with(':') && !trimmed.contains('('))
}

/// Quotes every target containing characters outside `[A-Za-z0-9_]`.
/// Matches are whole identifiers outside single-quoted literals; backtick
/// and bracket quoting is normalised to double quotes.
fn quote_targets(code: &str, valid_targets: &[String]) -> String {
    let mut targets = valid_targets
        .iter()
        .filter(|target| !target.is_empty())
        .filter(|target| !target.chars().all(is_identifier_char))
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return code.to_string();
    }
    targets.sort_by_key(|target| std::cmp::Reverse(target.len()));

    // Splitting on `'` alternates between code and literal text, including
    // around doubled `''` escapes.
    code.split('\'')
        .enumerate()
        .map(|(index, segment)| {
            if index % 2 == 0 {
                quote_in_segment(segment, &targets)
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("'")
}

fn quote_in_segment(segment: &str, targets: &[&String]) -> String {
    let mut quoted = String::with_capacity(segment.len());
    let mut index = 0;
    while let Some(current) = segment[index..].chars().next() {
        let rest = &segment[index..];
        let found = targets.iter().find(|target| {
            rest.starts_with(target.as_str())
                && !quoted.chars().next_back().is_some_and(is_identifier_char)
                && !segment[index + target.len()..].chars().next().is_some_and(is_identifier_char)
        });
        let Some(target) = found else {
            quoted.push(current);
            index += current.len_utf8();
            continue;
        };

        let after = index + target.len();
        let closing = segment[after..].chars().next();
        match (quoted.chars().next_back(), closing) {
            (Some('"'), Some('"')) => quoted.push_str(target),
            (Some(open @ ('`' | '[')), Some(close)) if close == closing_quote(open) => {
                quoted.pop();
                quoted.push_str(&format!("\"{target}\""));
                index = after + close.len_utf8();
                continue;
            }
            _ => quoted.push_str(&format!("\"{target}\"")),
        }
        index = after;
    }
    quoted
}

fn closing_quote(open: char) -> char {
    if open == '[' {
        ']'
    } else {
        open
    }
}

fn is_identifier_char(character: char) -> bool {
    character.is_ascii_alphanumeric() || character == '_'
}

/// Code with `--`, `#` and `//` line comments and `/* */` blocks removed.
/// Quoted text is kept as is.
fn strip_comments(code: &str) -> String {
    let mut stripped = String::with_capacity(code.len());
    let mut quote: Option<char> = None;
    let mut characters = code.chars().peekable();
    while let Some(character) = characters.next() {
        if let Some(open) = quote {
            stripped.push(character);
            if character == open {
                quote = None;
            }
            continue;
        }
        match (character, characters.peek().copied()) {
            ('\'' | '"' | '`', _) => {
                quote = Some(character);
                stripped.push(character);
            }
            ('-', Some('-')) | ('/', Some('/')) | ('#', _) => {
                while characters.next_if(|next| *next != '\n').is_some() {}
            }
            ('/', Some('*')) => {
                characters.next();
                let mut previous = ' ';
                for next in characters.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                stripped.push(' ');
            }
            _ => stripped.push(character),
        }
    }
    stripped
}

/// Truncation signatures: unbalanced brackets or quotes, or a trailing
/// operator or clause keyword. Comments are ignored.
fn is_incomplete(code: &str) -> bool {
    let stripped = strip_comments(code);
    let code = stripped.trim();
    if code.is_empty() {
        return true;
    }

    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    for character in code.chars() {
        match (quote, character) {
            (Some(open), current) if current == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(character),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            _ => {}
        }
    }
    if quote.is_some() || depth > 0 {
        return true;
    }

    let code = code.trim_end_matches(';').trim_end();
    if code.ends_with(['=', ',', '+', '-', '*', '/', '.', '(', '<', '>']) {
        return true;
    }
    let last_word = code.rsplit(|character: char| character.is_whitespace()).next().unwrap_or_default();
    DANGLING_KEYWORDS.iter().any(|keyword| last_word.eq_ignore_ascii_case(keyword))
}

/// Last few lines of a failure, capped in length.
fn failure_tail(failure: &str) -> String {
    let lines = failure.lines().filter(|line| !line.trim().is_empty()).collect::<Vec<_>>();
    let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
    let count = tail.chars().count();
    if count <= FAILURE_TAIL_CHARS {
        return tail;
    }
    tail.chars().skip(count - FAILURE_TAIL_CHARS).collect()
}
