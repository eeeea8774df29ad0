use std::collections::HashSet;

use super::{AppConfig, ConfigError};
use crate::protocol::canonical::TargetProtocol;

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_suppliers(config)?;
    validate_transform(config)?;
    validate_log_settings(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    Ok(())
}

const VALID_PROTOCOLS: &[&str] = &["anthropic", "openai-chat", "openai-responses", "gemini"];

fn validate_suppliers(config: &AppConfig) -> Result<(), ConfigError> {
    if config.suppliers.is_empty() {
        return Err(validation_err("suppliers cannot be empty"));
    }

    let mut ids = HashSet::new();
    for supplier in &config.suppliers {
        if supplier.id.trim().is_empty() {
            return Err(validation_err("supplier id cannot be empty"));
        }
        if !ids.insert(supplier.id.as_str()) {
            return Err(validation_err(format!(
                "duplicate supplier id '{}'",
                supplier.id
            )));
        }
        let parsed = url::Url::parse(&supplier.base_url).map_err(|err| {
            validation_err(format!(
                "Supplier '{}': base_url is not a valid URL: {err}",
                supplier.id
            ))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(validation_err(format!(
                "Supplier '{}': base_url must start with http:// or https://",
                supplier.id
            )));
        }
        if supplier.api_key.trim().is_empty() {
            return Err(validation_err(format!(
                "Supplier '{}': api_key cannot be empty",
                supplier.id
            )));
        }
        if supplier.protocol.trim().is_empty() {
            return Err(validation_err(format!(
                "Supplier '{}': protocol cannot be empty. Must be one of: {}",
                supplier.id,
                VALID_PROTOCOLS.join(", ")
            )));
        }
        if TargetProtocol::parse(&supplier.protocol).is_none() {
            tracing::warn!(
                supplier = %supplier.id,
                protocol = %supplier.protocol,
                "unknown protocol, requests will be forwarded unchanged"
            );
        }
        if supplier.models.iter().any(|model| model.trim().is_empty()) {
            return Err(validation_err(format!(
                "Supplier '{}': model name cannot be empty",
                supplier.id
            )));
        }
    }

    let defaults = config
        .suppliers
        .iter()
        .filter(|supplier| supplier.is_default)
        .count();
    if defaults > 1 {
        return Err(validation_err(
            "at most one supplier may set is_default: true",
        ));
    }
    Ok(())
}

fn validate_transform(config: &AppConfig) -> Result<(), ConfigError> {
    let transform = &config.transform;
    if transform.tool_name_limit == 0 {
        return Err(validation_err(
            "transform.tool_name_limit must be greater than 0",
        ));
    }
    if let Some(effort) = transform.responses.reasoning_effort.as_deref() {
        if !matches!(effort, "low" | "medium" | "high") {
            return Err(validation_err(format!(
                "transform.responses.reasoning_effort must be low, medium or high, got '{effort}'"
            )));
        }
    }
    Ok(())
}

fn validate_log_settings(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    if !matches!(config.features.log_format.as_str(), "text" | "json") {
        return Err(validation_err("log_format must be 'text' or 'json'"));
    }
    Ok(())
}
