//! Prompt text for every model call the engine makes.

use tabula_core::{ActToken, ClarificationRequest, CodeDialect, Flow, SchemaCatalog};

use crate::nlu::UnderstandingContext;

fn token_vocabulary() -> String {
    b"0123456789ABCDEF"
        .iter()
        .filter_map(|symbol| ActToken::from_symbol(*symbol))
        .map(ActToken::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn classifier_prompt(context: &UnderstandingContext<'_>) -> String {
    format!(
        "Classify the last user turn into at most three act tokens from: {tokens}.\n\
         Reply with the tokens separated by commas.\n\n\
         Tables:\n{tables}\n\nConversation:\n{transcript}",
        tokens = token_vocabulary(),
        tables = context.catalog.describe(),
        transcript = context.transcript(),
    )
}

pub fn reasoner_prompt(context: &UnderstandingContext<'_>) -> String {
    let priors = context
        .priors
        .iter()
        .map(|prior| {
            format!("- {}: {} ({:.2})", prior.source.as_str(), prior.act, prior.confidence)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Decide what the user wants in the last turn.\n\
         Act tokens: {tokens}.\n\
         Answer with one JSON object: {{\"thought\": string, \"dacts\": [token], \
         \"entities\": [{{\"table\": string, \"column\": string}}], \"confidence\": number, \
         \"slots\": object}}.\n\n\
         Current table: {table}\nTables:\n{tables}\n\nHints from faster models:\n{priors}\n\n\
         Conversation:\n{transcript}",
        tokens = token_vocabulary(),
        table = context.current_table.unwrap_or("none"),
        tables = context.catalog.describe(),
        priors = if priors.is_empty() { "- none".to_string() } else { priors },
        transcript = context.transcript(),
    )
}

pub fn column_finder_prompt(table: &str, column: &str, catalog: &SchemaCatalog) -> String {
    format!(
        "The user referred to a column `{column}` in table `{table}`, which does not exist.\n\
         Pick the closest real column. Answer with one JSON object: \
         {{\"match\": \"yes\" | \"maybe\" | \"no\", \"table\": string, \"column\": string}}.\n\n\
         Tables:\n{tables}",
        tables = catalog.describe(),
    )
}

pub fn clarification_prompt(request: &ClarificationRequest, transcript: &str) -> String {
    let values = if request.values.is_empty() { "none".to_string() } else { request.values.join(", ") };
    format!(
        "Write one short clarifying question for the user.\n\
         Goal: {goal}\nUncertainty: {level}\nSlot: {slot}\nCandidates: {values}\n\
         Tables: {tables}\nColumns: {columns}\n\nConversation:\n{transcript}",
        goal = request.goal,
        level = request.level,
        slot = request.slot.as_deref().unwrap_or("none"),
        tables = request.tables.join(", "),
        columns = request.columns.join(", "),
    )
}

/// Asks for code carrying out the active flow.
pub fn code_prompt(
    flow: &Flow,
    dialect: CodeDialect,
    summary: &str,
    catalog: &SchemaCatalog,
    transcript: &str,
) -> String {
    let sources = flow
        .entities()
        .members()
        .iter()
        .map(|entity| format!("{}.{}", entity.table, entity.column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Write {dialect} code to {goal}.\n\
         Use only these sources: {sources}.\n\
         If the request cannot be done with the data, reply with `error: <reason>`.\n\
         Return only the code.\n\n\
         Tables:\n{tables}\n\nState:\n{summary}\n\nConversation:\n{transcript}",
        dialect = dialect.as_str(),
        goal = flow.goal(),
        tables = catalog.describe(),
    )
}

pub fn chat_prompt(catalog: &SchemaCatalog, transcript: &str) -> String {
    format!(
        "Reply briefly to the user. You help them work with these tables:\n{tables}\n\n         Conversation:\n{transcript}",
        tables = catalog.describe(),
    )
}

pub fn repair_prompt(code: &str, failure: &str, summary: &str, preview: &str, transcript: &str) -> String {
    format!(
        "This code failed.\n\nCode:\n{code}\n\nFailure:\n{failure}\n\n\
         State:\n{summary}\n\nData preview:\n{preview}\n\nConversation:\n{transcript}\n\n\
         Return only the corrected code."
    )
}
