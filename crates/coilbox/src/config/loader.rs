//! Configuration file loading for Coilbox
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};
use tracing::debug;

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "read configuration file");
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.program_name.is_empty() {
            return Err(ConfigError::Invalid("program_name is empty".to_string()));
        }

        if let Some(ref dir) = self.bytecode_cache_dir
            && !dir.starts_with('/')
        {
            return Err(ConfigError::Invalid(format!(
                "bytecode_cache_dir must be an absolute guest path, got '{dir}'"
            )));
        }

        if self.default_limits.memory_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "default_limits.memory_bytes must be greater than zero".to_string(),
            ));
        }

        for mount in &self.sandbox_mounts {
            if mount.source.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount for '{}' has empty source",
                    mount.target
                )));
            }
            if !mount.target.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "mount target '{}' must be an absolute guest path",
                    mount.target
                )));
            }
        }

        Ok(())
    }
}
