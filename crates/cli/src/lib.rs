pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tabula_core::config::{AppConfig, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tabula",
    about = "Tabula dialogue engine CLI",
    long_about = "Inspect configuration, check readiness, list the schema catalog, and chat with your tables.",
    after_help = "Examples:\n  tabula doctor --json\n  tabula catalog\n  tabula chat --conversation demo"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, and the schema catalog")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List the tables and columns the engine can reference")]
    Catalog,
    #[command(about = "Read one turn per stdin line and print each outcome as JSON")]
    Chat {
        #[arg(long, help = "Conversation id recorded on audit events")]
        conversation: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Catalog => commands::catalog::run(),
        Command::Chat { conversation } => commands::chat::run(conversation),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber on stderr so stdout stays machine-readable.
/// A second call is a no-op.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.trim().to_ascii_lowercase()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
