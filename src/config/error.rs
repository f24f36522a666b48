use thiserror::Error;

use crate::error::EngineError;

/// Errors raised while loading or validating engine configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid value for '{field}': {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(#[from] config::ConfigError),
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigurationError> for EngineError {
    fn from(error: ConfigurationError) -> Self {
        EngineError::InvalidConfiguration(error.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
