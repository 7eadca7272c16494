use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub dialogue: DialogueConfig,
    pub guardrails: GuardrailConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

/// Tuning for understanding, repair and execution.
#[derive(Clone, Debug, PartialEq)]
pub struct DialogueConfig {
    pub max_attempts: u32,
    pub repair_iterations: u32,
    pub history_window: usize,
    pub retriever_k: usize,
    pub pattern_override_threshold: f64,
    pub table_match_cutoff: f64,
    pub column_match_cutoff: f64,
    pub store_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailConfig {
    pub allow_destructive: bool,
    pub allow_raw_code: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub allow_destructive: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            repair_iterations: 3,
            history_window: 5,
            retriever_k: 7,
            pattern_override_threshold: 0.9,
            table_match_cutoff: 0.6,
            column_match_cutoff: 0.8,
            store_timeout_secs: 30,
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self { allow_destructive: false, allow_raw_code: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tabula.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_tokens: 512,
            },
            dialogue: DialogueConfig::default(),
            guardrails: GuardrailConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tabula.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(dialogue) = patch.dialogue {
            if let Some(max_attempts) = dialogue.max_attempts {
                self.dialogue.max_attempts = max_attempts;
            }
            if let Some(repair_iterations) = dialogue.repair_iterations {
                self.dialogue.repair_iterations = repair_iterations;
            }
            if let Some(history_window) = dialogue.history_window {
                self.dialogue.history_window = history_window;
            }
            if let Some(retriever_k) = dialogue.retriever_k {
                self.dialogue.retriever_k = retriever_k;
            }
            if let Some(threshold) = dialogue.pattern_override_threshold {
                self.dialogue.pattern_override_threshold = threshold;
            }
            if let Some(cutoff) = dialogue.table_match_cutoff {
                self.dialogue.table_match_cutoff = cutoff;
            }
            if let Some(cutoff) = dialogue.column_match_cutoff {
                self.dialogue.column_match_cutoff = cutoff;
            }
            if let Some(store_timeout_secs) = dialogue.store_timeout_secs {
                self.dialogue.store_timeout_secs = store_timeout_secs;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(allow_destructive) = guardrails.allow_destructive {
                self.guardrails.allow_destructive = allow_destructive;
            }
            if let Some(allow_raw_code) = guardrails.allow_raw_code {
                self.guardrails.allow_raw_code = allow_raw_code;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TABULA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TABULA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TABULA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TABULA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TABULA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TABULA_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TABULA_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TABULA_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TABULA_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TABULA_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("TABULA_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TABULA_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("TABULA_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("TABULA_DIALOGUE_MAX_ATTEMPTS") {
            self.dialogue.max_attempts = parse_u32("TABULA_DIALOGUE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TABULA_DIALOGUE_REPAIR_ITERATIONS") {
            self.dialogue.repair_iterations =
                parse_u32("TABULA_DIALOGUE_REPAIR_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("TABULA_DIALOGUE_HISTORY_WINDOW") {
            self.dialogue.history_window = parse_usize("TABULA_DIALOGUE_HISTORY_WINDOW", &value)?;
        }
        if let Some(value) = read_env("TABULA_DIALOGUE_RETRIEVER_K") {
            self.dialogue.retriever_k = parse_usize("TABULA_DIALOGUE_RETRIEVER_K", &value)?;
        }
        if let Some(value) = read_env("TABULA_DIALOGUE_STORE_TIMEOUT_SECS") {
            self.dialogue.store_timeout_secs =
                parse_u64("TABULA_DIALOGUE_STORE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TABULA_GUARDRAILS_ALLOW_DESTRUCTIVE") {
            self.guardrails.allow_destructive =
                parse_bool("TABULA_GUARDRAILS_ALLOW_DESTRUCTIVE", &value)?;
        }
        if let Some(value) = read_env("TABULA_GUARDRAILS_ALLOW_RAW_CODE") {
            self.guardrails.allow_raw_code =
                parse_bool("TABULA_GUARDRAILS_ALLOW_RAW_CODE", &value)?;
        }

        let log_level = read_env("TABULA_LOGGING_LEVEL").or_else(|| read_env("TABULA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TABULA_LOGGING_FORMAT").or_else(|| read_env("TABULA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.dialogue.max_attempts = max_attempts;
        }
        if let Some(allow_destructive) = overrides.allow_destructive {
            self.guardrails.allow_destructive = allow_destructive;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_dialogue(&self.dialogue)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tabula.toml"), PathBuf::from("config/tabula.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_tokens < 16 {
        return Err(ConfigError::Validation("llm.max_tokens must be at least 16".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_dialogue(dialogue: &DialogueConfig) -> Result<(), ConfigError> {
    if dialogue.max_attempts == 0 || dialogue.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "dialogue.max_attempts must be in range 1..=10".to_string(),
        ));
    }

    if dialogue.history_window == 0 {
        return Err(ConfigError::Validation(
            "dialogue.history_window must be greater than zero".to_string(),
        ));
    }

    if dialogue.retriever_k == 0 {
        return Err(ConfigError::Validation(
            "dialogue.retriever_k must be greater than zero".to_string(),
        ));
    }

    let cutoffs = [
        ("dialogue.pattern_override_threshold", dialogue.pattern_override_threshold),
        ("dialogue.table_match_cutoff", dialogue.table_match_cutoff),
        ("dialogue.column_match_cutoff", dialogue.column_match_cutoff),
    ];
    for (key, value) in cutoffs {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!("{key} must be within 0.0..=1.0")));
        }
    }

    if dialogue.store_timeout_secs == 0 || dialogue.store_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "dialogue.store_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    dialogue: Option<DialoguePatch>,
    guardrails: Option<GuardrailPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DialoguePatch {
    max_attempts: Option<u32>,
    repair_iterations: Option<u32>,
    history_window: Option<usize>,
    retriever_k: Option<usize>,
    pattern_override_threshold: Option<f64>,
    table_match_cutoff: Option<f64>,
    column_match_cutoff: Option<f64>,
    store_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailPatch {
    allow_destructive: Option<bool>,
    allow_raw_code: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
