pub mod validation;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::canonical::TargetProtocol;
use crate::protocol::schema::ToolSchemaPolicy;
use crate::protocol::tool_name::TOOL_NAME_LIMIT;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
        }
    }
}

/// One upstream supplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    /// Wire protocol name: `anthropic`, `openai-chat`, `openai-responses` or `gemini`.
    /// Unknown names fall back to forwarding the client request unchanged.
    pub protocol: String,
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl SupplierConfig {
    /// Parsed protocol, `None` for names the gateway does not know.
    #[must_use]
    pub fn target_protocol(&self) -> Option<TargetProtocol> {
        TargetProtocol::parse(&self.protocol)
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// What to do with a Responses `custom_tool_call` whose input is a bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CustomToolCallStrategy {
    /// Forward as `{"input": "<string>"}`.
    #[default]
    WrapObject,
    /// Fail the stream with an error event.
    Error,
}

impl fmt::Display for CustomToolCallStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomToolCallStrategy::WrapObject => write!(f, "wrap_object"),
            CustomToolCallStrategy::Error => write!(f, "error"),
        }
    }
}

/// Responses-target request settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesConfig {
    /// Replaces `instructions`; the client's system text then becomes a
    /// leading developer message.
    #[serde(default)]
    pub instructions_template: Option<String>,
    /// `low`, `medium` or `high`; defaults to `medium`.
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    /// Request `reasoning.encrypted_content` in `include`.
    #[serde(default = "default_true")]
    pub include_reasoning_content: bool,
}

/// Transformation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub custom_tool_call_strategy: CustomToolCallStrategy,
    #[serde(default)]
    pub tool_schema: ToolSchemaPolicy,
    #[serde(default)]
    pub responses: ResponsesConfig,
    #[serde(default = "default_tool_name_limit")]
    pub tool_name_limit: usize,
}

fn default_tool_name_limit() -> usize {
    TOOL_NAME_LIMIT
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            custom_tool_call_strategy: CustomToolCallStrategy::default(),
            tool_schema: ToolSchemaPolicy::default(),
            responses: ResponsesConfig {
                include_reasoning_content: true,
                ..ResponsesConfig::default()
            },
            tool_name_limit: default_tool_name_limit(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub suppliers: Vec<SupplierConfig>,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Parse and validate a YAML document.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
