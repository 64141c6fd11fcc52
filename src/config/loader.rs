//! Configuration Loader
//!
//! Layers an optional configuration file (TOML, YAML or JSON, chosen by
//! extension) under `TM__` prefixed environment variables. Nested keys are
//! separated by `__`, e.g. `TM__PERSISTENCE__MAX_ATTEMPTS=3`.

use config::{Config, Environment, File};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;

pub const ENV_PREFIX: &str = "TM";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    environment: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file first; it must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use the given variables instead of the process environment
    pub fn with_environment(mut self, variables: HashMap<String, String>) -> Self {
        self.environment = Some(variables);
        self
    }

    /// Load and validate the configuration
    pub fn load(&self) -> ConfigResult<OrchestratorConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.file {
            if !path.is_file() {
                return Err(ConfigurationError::FileNotFound { path: path.clone() });
            }
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(self.environment.clone()),
        );

        let config: OrchestratorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            file = ?self.file,
            max_retries = config.retry.max_retries,
            retry_mode = ?config.retry.mode,
            persistence_attempts = config.persistence.max_attempts,
            "Configuration loaded successfully"
        );

        Ok(config)
    }
}
