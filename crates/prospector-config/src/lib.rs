use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub engine: Engine,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// Text-generation endpoint used by the extraction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the bearer key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for Chat {
    fn default() -> Self {
        Self {
            turn_timeout_ms: default_turn_timeout_ms(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_temperature() -> f64 {
    0.7
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_turn_timeout_ms() -> u64 {
    30_000
}

fn default_max_message_chars() -> usize {
    4_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.engine.provider != "openai" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "engine.provider={} is not implemented; supported: openai",
            cfg.engine.provider
        )));
    }
    if !cfg.engine.endpoint.starts_with("http://") && !cfg.engine.endpoint.starts_with("https://")
    {
        return Err(ConfigError::UnsupportedConfig(
            "engine.endpoint must be an http(s) URL".to_string(),
        ));
    }
    if cfg.engine.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "engine.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.engine.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "engine.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.chat.turn_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "chat.turn_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.chat.max_message_chars == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "chat.max_message_chars must be >= 1".to_string(),
        ));
    }
    Ok(())
}
