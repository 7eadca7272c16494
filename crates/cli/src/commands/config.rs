use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tabula_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let fields = vec![
        field("database.url", redact_url(&config.database.url), &["TABULA_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["TABULA_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["TABULA_DATABASE_TIMEOUT_SECS"],
        ),
        field("llm.provider", format!("{:?}", config.llm.provider), &["TABULA_LLM_PROVIDER"]),
        field("llm.model", config.llm.model.clone(), &["TABULA_LLM_MODEL"]),
        field(
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["TABULA_LLM_BASE_URL"],
        ),
        field("llm.api_key", llm_api_key.to_string(), &["TABULA_LLM_API_KEY"]),
        field("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["TABULA_LLM_TIMEOUT_SECS"]),
        field("llm.max_tokens", config.llm.max_tokens.to_string(), &["TABULA_LLM_MAX_TOKENS"]),
        field(
            "dialogue.max_attempts",
            config.dialogue.max_attempts.to_string(),
            &["TABULA_DIALOGUE_MAX_ATTEMPTS"],
        ),
        field(
            "dialogue.history_window",
            config.dialogue.history_window.to_string(),
            &["TABULA_DIALOGUE_HISTORY_WINDOW"],
        ),
        field(
            "dialogue.retriever_k",
            config.dialogue.retriever_k.to_string(),
            &["TABULA_DIALOGUE_RETRIEVER_K"],
        ),
        field(
            "guardrails.allow_destructive",
            config.guardrails.allow_destructive.to_string(),
            &["TABULA_GUARDRAILS_ALLOW_DESTRUCTIVE"],
        ),
        field(
            "guardrails.allow_raw_code",
            config.guardrails.allow_raw_code.to_string(),
            &["TABULA_GUARDRAILS_ALLOW_RAW_CODE"],
        ),
        field("logging.level", config.logging.level.clone(), &["TABULA_LOGGING_LEVEL", "TABULA_LOG_LEVEL"]),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["TABULA_LOGGING_FORMAT", "TABULA_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in fields {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }
    lines.join("\n")
}

type Field = (&'static str, String, &'static [&'static str]);

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Field {
    (key, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("tabula.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/tabula.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Hides credentials embedded as `user:password@` in a connection URL.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}
