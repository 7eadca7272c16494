use std::env;
use std::io::Cursor;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use tabula_cli::commands::{catalog, chat, config, doctor};
use tabula_core::config::AppConfig;

#[test]
fn doctor_passes_against_an_in_memory_database() {
    with_env(
        &[("TABULA_DATABASE_URL", "sqlite::memory:"), ("TABULA_DATABASE_MAX_CONNECTIONS", "1")],
        || {
            let report: Value =
                serde_json::from_str(&doctor::run(true)).expect("doctor output should be json");
            assert_eq!(report["overall_status"], "pass");

            let names = report["checks"]
                .as_array()
                .expect("checks array")
                .iter()
                .map(|check| check["name"].as_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>();
            assert_eq!(
                names,
                vec!["config_validation", "llm_configuration", "database_connectivity", "schema_catalog"]
            );
        },
    );
}

#[test]
fn doctor_skips_downstream_checks_when_config_is_invalid() {
    with_env(&[("TABULA_DATABASE_URL", "postgres://localhost/tabula")], || {
        let report: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor output should be json");
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(report["checks"][0]["status"], "fail");
        assert_eq!(report["checks"][3]["status"], "skipped");
    });
}

#[test]
fn config_reports_env_sources_and_redacts_secrets() {
    with_env(
        &[
            ("TABULA_DATABASE_URL", "sqlite::memory:"),
            ("TABULA_LLM_API_KEY", "sk-test-secret"),
            ("TABULA_LOG_LEVEL", "debug"),
        ],
        || {
            let output = config::run();
            assert!(output.contains("database.url = sqlite::memory: (source: env (TABULA_DATABASE_URL))"));
            assert!(output.contains("llm.api_key = <redacted>"));
            assert!(!output.contains("sk-test-secret"));
            assert!(output.contains("logging.level = debug (source: env (TABULA_LOG_LEVEL))"));
            assert!(output.contains("dialogue.max_attempts = 3 (source: default)"));
        },
    );
}

#[test]
fn catalog_reports_an_empty_database() {
    with_env(
        &[("TABULA_DATABASE_URL", "sqlite::memory:"), ("TABULA_DATABASE_MAX_CONNECTIONS", "1")],
        || {
            let result = catalog::run();
            assert_eq!(result.exit_code, 0, "expected catalog success");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "catalog");
            assert_eq!(payload["status"], "ok");
            assert_eq!(payload["message"], "no tables found in the configured database");
        },
    );
}

#[test]
fn catalog_returns_config_failure_for_unsupported_database() {
    with_env(&[("TABULA_DATABASE_URL", "postgres://localhost/tabula")], || {
        let result = catalog::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn chat_answers_one_json_line_per_turn() {
    let mut config = AppConfig::default();
    config.database.url = "sqlite::memory:".to_string();
    config.database.max_connections = 1;

    let input = Cursor::new("/sql SELECT 1 AS one\n\n/act 07C\n");
    let mut output = Vec::new();
    let result = chat::run_with_io(&config, Some("cli-test".to_string()), input, &mut output);

    assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);
    assert_eq!(parse_payload(&result.output)["message"], "chat ended after 2 turns");

    let lines = String::from_utf8(output).expect("utf8 output");
    let outcomes = lines.lines().map(parse_payload).collect::<Vec<_>>();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0]["outcome"], "completed");
    assert_eq!(outcomes[0]["result"]["columns"][0], "one");
    assert_eq!(outcomes[0]["result"]["rows"][0][0], 1);
    assert_eq!(outcomes[1]["outcome"], "unsupported");
}

#[test]
fn chat_fails_cleanly_when_the_database_is_unreachable() {
    let mut config = AppConfig::default();
    config.database.url = "sqlite:///nonexistent-dir/tabula.db".to_string();

    let result = chat::run_with_io(&config, None, Cursor::new(""), Vec::<u8>::new());

    assert_eq!(result.exit_code, 4);
    assert_eq!(parse_payload(&result.output)["error_class"], "db_connectivity");
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("output should be json")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "TABULA_DATABASE_URL",
        "TABULA_DATABASE_MAX_CONNECTIONS",
        "TABULA_DATABASE_TIMEOUT_SECS",
        "TABULA_LLM_PROVIDER",
        "TABULA_LLM_API_KEY",
        "TABULA_LLM_BASE_URL",
        "TABULA_LLM_MODEL",
        "TABULA_LLM_TIMEOUT_SECS",
        "TABULA_LLM_MAX_TOKENS",
        "TABULA_DIALOGUE_MAX_ATTEMPTS",
        "TABULA_DIALOGUE_REPAIR_ITERATIONS",
        "TABULA_DIALOGUE_HISTORY_WINDOW",
        "TABULA_DIALOGUE_RETRIEVER_K",
        "TABULA_DIALOGUE_STORE_TIMEOUT_SECS",
        "TABULA_GUARDRAILS_ALLOW_DESTRUCTIVE",
        "TABULA_GUARDRAILS_ALLOW_RAW_CODE",
        "TABULA_LOGGING_LEVEL",
        "TABULA_LOGGING_FORMAT",
        "TABULA_LOG_LEVEL",
        "TABULA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
