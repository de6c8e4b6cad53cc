use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
        }
    }
}

impl ApiConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("API_HOST", "0.0.0.0")?,
            port: parse_optional_env("API_PORT", 8001)?,
        })
    }
}
