use crate::commands::{CommandFailure, CommandResult};
use tabula_core::config::{AppConfig, LoadOptions};
use tabula_db::{connect_from_config, load_catalog};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "catalog",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "catalog",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), 4))?;
        let catalog = load_catalog(&pool)
            .await
            .map_err(|error| CommandFailure::new("schema_catalog", error.to_string(), 5))?;
        pool.close().await;
        Ok::<_, CommandFailure>(catalog)
    });

    match result {
        Ok(catalog) if catalog.is_empty() => {
            CommandResult::success("catalog", "no tables found in the configured database")
        }
        Ok(catalog) => CommandResult::success("catalog", catalog.describe()),
        Err(failure) => failure.into_result("catalog"),
    }
}
