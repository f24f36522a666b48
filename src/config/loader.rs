//! Configuration Loader
//!
//! Caller-side helper that layers an optional config file (TOML, YAML or JSON, by
//! extension) and environment overrides over the built-in defaults, then validates
//! the result. Missing keys keep their defaults.

use std::path::PathBuf;
use tracing::debug;

use super::error::ConfigResult;
use super::EngineConfig;

/// Default environment prefix; `LOOKUP_ENGINE__RETRY__MAX_ATTEMPTS=5` sets `retry.max_attempts`
pub const DEFAULT_ENV_PREFIX: &str = "LOOKUP_ENGINE";

/// Builder for layered [`EngineConfig`] loading
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from a file; the file must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Apply `LOOKUP_ENGINE__*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_env_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Build, deserialize and validate the configuration
    pub fn load(&self) -> ConfigResult<EngineConfig> {
        let mut builder = config::Config::builder();

        if let Some(path) = &self.file {
            debug!(path = %path.display(), "Loading engine configuration file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            max_attempts = config.retry.max_attempts,
            pool_max_size = config.pool.max_size,
            worker_count = ?config.workers.worker_count,
            "Engine configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationError;
    use std::io::Write;

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_partial_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
job_timeout_ms = 15000

[retry]
max_attempts = 5

[pool]
max_size = 4

[rate_limits.resources."scrape:treasurer"]
capacity = 2
refill_per_second = 0.5
adaptive = false

[circuit_breakers.resources.api]
failure_threshold = 3
cooldown_ms = 1000
"#
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(file.path()).load().unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.job_timeout_ms, Some(15_000));
        assert_eq!(
            config.rate_limits.config_for_resource("scrape:treasurer").capacity,
            2
        );
        assert_eq!(
            config
                .circuit_breakers
                .config_for_resource("api")
                .failure_threshold,
            3
        );
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("LOOKUP_ENGINE_LOADER_TEST__RETRY__MAX_ATTEMPTS", "7");
        let config = ConfigLoader::new()
            .with_env_prefix("LOOKUP_ENGINE_LOADER_TEST")
            .load()
            .unwrap();
        std::env::remove_var("LOOKUP_ENGINE_LOADER_TEST__RETRY__MAX_ATTEMPTS");

        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\nmax_size = 0").unwrap();

        let result = ConfigLoader::new().with_file(file.path()).load();
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ConfigLoader::new()
            .with_file("/definitely/not/here/lookup_engine.toml")
            .load();
        assert!(matches!(result, Err(ConfigurationError::LoadFailed(_))));
    }
}
