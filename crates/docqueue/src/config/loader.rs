use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let workers = &config.workers;
    if workers.count == 0 {
        return Err(invalid("workers.count must be at least 1"));
    }
    if workers.hard_time_limit_secs == 0 {
        return Err(invalid("workers.hard_time_limit_secs must be positive"));
    }
    if workers.soft_time_limit_secs >= workers.hard_time_limit_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "workers.soft_time_limit_secs ({}) must be below hard_time_limit_secs ({})",
                workers.soft_time_limit_secs, workers.hard_time_limit_secs
            ),
        });
    }
    if workers.max_deliveries == 0 {
        return Err(invalid("workers.max_deliveries must be at least 1"));
    }

    if config.broker.lease_secs == 0 || config.broker.poll_interval_ms == 0 {
        return Err(invalid("broker lease and poll interval must be positive"));
    }
    if config.retention.window_secs == 0 || config.retention.sweep_interval_secs == 0 {
        return Err(invalid("retention window and sweep interval must be positive"));
    }
    if config.reconcile.stuck_pending_secs == 0 || config.reconcile.interval_secs == 0 {
        return Err(invalid("reconcile intervals must be positive"));
    }
    if config.retention.batch_size == 0 || config.reconcile.batch_size == 0 {
        return Err(invalid("batch sizes must be at least 1"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
