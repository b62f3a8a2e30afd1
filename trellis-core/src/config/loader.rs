use std::path::Path;

use crate::config::schema::{Config, StorageBackendKind};
use crate::error::{Error, Result};

pub fn load_from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read config '{}': {err}", path.display()))
    })?;

    toml::from_str(&content).map_err(|err| {
        Error::Config(format!(
            "failed to parse config '{}': {err}",
            path.display()
        ))
    })
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Environment overrides, read through `lookup` so callers can inject a
/// fixed environment:
///
/// - `TRELLIS_ENVIRONMENT`
/// - `TRELLIS_DATABASE_URL` (switches the store to SQLite)
/// - `TRELLIS_MAX_RETRIES`, `TRELLIS_RETRY_DELAY_MS`
/// - `TRELLIS_TOPIC_<KEY>` for each topic key, e.g. `TRELLIS_TOPIC_DB_QUERY`
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(environment) = lookup("TRELLIS_ENVIRONMENT") {
        config.environment = environment;
    }

    if let Some(url) = lookup("TRELLIS_DATABASE_URL") {
        config.storage.backend = StorageBackendKind::Sqlite;
        config.storage.connection_string = url;
    }

    if let Some(raw) = lookup("TRELLIS_MAX_RETRIES") {
        config.retry.max_retries = raw.trim().parse().map_err(|err| {
            Error::Config(format!("TRELLIS_MAX_RETRIES '{raw}' is not a number: {err}"))
        })?;
    }

    if let Some(raw) = lookup("TRELLIS_RETRY_DELAY_MS") {
        config.retry.delay_ms = raw.trim().parse().map_err(|err| {
            Error::Config(format!(
                "TRELLIS_RETRY_DELAY_MS '{raw}' is not a number: {err}"
            ))
        })?;
    }

    let keys: Vec<String> = config.topics.keys().cloned().collect();
    for key in keys {
        let variable = format!("TRELLIS_TOPIC_{}", key.to_ascii_uppercase());
        if let Some(topic) = lookup(&variable) {
            config.topics.insert(key, topic);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("TRELLIS_ENVIRONMENT", "wgs35"),
            ("TRELLIS_DATABASE_URL", "sqlite://graph.db"),
            ("TRELLIS_RETRY_DELAY_MS", "5"),
            ("TRELLIS_TOPIC_DB_QUERY", "wgs35-db-query"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| (*v).to_owned()))
            .expect("overrides");

        assert_eq!(config.environment, "wgs35");
        assert_eq!(config.storage.backend, StorageBackendKind::Sqlite);
        assert_eq!(config.storage.connection_string, "sqlite://graph.db");
        assert_eq!(config.retry.delay_ms, 5);
        assert_eq!(config.topics["db_query"], "wgs35-db-query");
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let mut config = Config::default();
        let error = apply_env_overrides(&mut config, |key| {
            (key == "TRELLIS_MAX_RETRIES").then(|| "three".to_owned())
        })
        .expect_err("should fail");
        assert!(error.to_string().contains("TRELLIS_MAX_RETRIES"));
    }
}
