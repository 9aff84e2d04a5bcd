use serde::{Deserialize, Serialize};

use crate::configs::*;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub decoding: DecodingConfig,
    #[serde(default)]
    pub opus: OpusConfig,
}

use crate::common::types::AnyResult;

impl Config {
    /// Loads `config.toml`, then `config.default.toml`, and falls back to
    /// built-in defaults when neither exists.
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Ok(Self::default());
        };

        let config_str = std::fs::read_to_string(config_path)?;
        Self::parse(&config_str).map_err(|e| format!("{}: {}", config_path, e).into())
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        if config_str.trim().is_empty() {
            return Err("configuration is empty".into());
        }
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }
}
