use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde_json::json;
use tabula_agent::llm::HttpLlmClient;
use tabula_agent::runtime::AgentRuntime;
use tabula_core::audit::TracingAuditSink;
use tabula_core::config::{AppConfig, LoadOptions};
use tabula_core::Conversation;
use tabula_db::{connect_from_config, load_catalog, SqliteDataStore};

use crate::commands::{CommandFailure, CommandResult};
use crate::init_logging;

pub fn run(conversation: Option<String>) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    init_logging(&config);

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_with_io(&config, conversation, stdin.lock(), stdout.lock())
}

/// Runs one conversation over line-oriented I/O: every non-empty input line
/// is a user turn and every outcome is written back as one JSON line.
pub fn run_with_io<R: BufRead, W: Write>(
    config: &AppConfig,
    conversation: Option<String>,
    input: R,
    output: W,
) -> CommandResult {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(session(config, conversation, input, output)) {
        Ok(turns) => CommandResult::success("chat", format!("chat ended after {turns} turns")),
        Err(failure) => failure.into_result("chat"),
    }
}

async fn session<R: BufRead, W: Write>(
    config: &AppConfig,
    conversation_id: Option<String>,
    input: R,
    mut output: W,
) -> Result<usize, CommandFailure> {
    let pool = connect_from_config(&config.database)
        .await
        .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), 4))?;
    let catalog = load_catalog(&pool)
        .await
        .map_err(|error| CommandFailure::new("schema_catalog", error.to_string(), 5))?;
    let llm = HttpLlmClient::from_config(&config.llm)
        .map_err(|error| CommandFailure::new("llm_client", error.to_string(), 6))?;

    let agent = AgentRuntime::from_config(
        config,
        Arc::new(llm),
        Arc::new(SqliteDataStore::new(pool.clone())),
        Arc::new(catalog),
    )
    .await
    .map_err(|error| CommandFailure::new("agent_init", error.to_string(), 6))?
    .with_audit(Arc::new(TracingAuditSink));

    let mut conversation = match conversation_id {
        Some(id) => Conversation::with_id(id),
        None => Conversation::new(),
    };
    tracing::info!(
        event_name = "cli.chat.started",
        conversation_id = %conversation.id,
        tables = agent.catalog().table_names().count(),
    );

    let mut turns = 0;
    for line in input.lines() {
        let line = line.map_err(|error| CommandFailure::new("input_read", error.to_string(), 7))?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        turns += 1;

        let payload = match agent.handle_turn(&mut conversation, text, None).await {
            Ok(outcome) => serde_json::to_value(&outcome)
                .map_err(|error| CommandFailure::new("serialization", error.to_string(), 8))?,
            Err(error) => {
                tracing::warn!(
                    event_name = "cli.chat.turn_failed",
                    conversation_id = %conversation.id,
                    turn = turns,
                    error = %error,
                );
                let error = error.into_interface(format!("{}:{turns}", conversation.id));
                json!({ "outcome": "error", "message": error.user_message() })
            }
        };
        writeln!(output, "{payload}")
            .and_then(|()| output.flush())
            .map_err(|error| CommandFailure::new("output_write", error.to_string(), 7))?;
    }

    pool.close().await;
    tracing::info!(event_name = "cli.chat.ended", conversation_id = %conversation.id, turns);
    Ok(turns)
}
