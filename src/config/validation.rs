use crate::config::types::{
    BackendKind, Config, CrawlerConfig, HttpConfig, SeedEntry, StorageConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_storage_config(&config.storage)?;
    validate_http_config(&config.http)?;
    validate_seeds(&config.seeds)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.threads < 1 || config.threads > 1000 {
        return Err(ConfigError::Validation(format!(
            "threads must be between 1 and 1000, got {}",
            config.threads
        )));
    }

    validate_limit("top-n", config.top_n)?;
    validate_limit("max-execute-count", config.max_execute_count)?;

    if config.depth < 1 {
        return Err(ConfigError::Validation(
            "depth must be >= 1, got 0".to_string(),
        ));
    }

    Ok(())
}

/// A limit is either -1 (none) or positive
fn validate_limit(name: &str, value: i64) -> Result<(), ConfigError> {
    if value == -1 || value > 0 {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{} must be -1 (unlimited) or positive, got {}",
            name, value
        )))
    }
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.backend == BackendKind::Sqlite && config.path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "storage path cannot be empty for the sqlite backend".to_string(),
        ));
    }
    Ok(())
}

/// Validates HTTP visitor configuration
fn validate_http_config(config: &HttpConfig) -> Result<(), ConfigError> {
    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout-secs must be >= 1".to_string(),
        ));
    }

    config
        .regex_rule()
        .map_err(|e| ConfigError::Validation(format!("Invalid URL rule in http.regex: {}", e)))?;

    Ok(())
}

/// Validates seed entries
fn validate_seeds(seeds: &[SeedEntry]) -> Result<(), ConfigError> {
    for seed in seeds {
        Url::parse(&seed.url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed.url, e))
        })?;

        if seed.type_tag.as_deref().is_some_and(|t| t.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Seed '{}' has an empty type tag",
                seed.url
            )));
        }
    }
    Ok(())
}
