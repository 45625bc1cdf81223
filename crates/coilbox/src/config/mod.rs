use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::sandbox::DEFAULT_PROGRAM_NAME;
use crate::types::{MountConfig, ResourceLimits};

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../coilbox.example.toml");

/// Read a `[default_limits]` table as overrides of [`ResourceLimits::default`]
fn limits_over_builtin<'de, D>(deserializer: D) -> Result<ResourceLimits, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = ResourceLimits::deserialize(deserializer)?;
    Ok(ResourceLimits::default().with_overrides(&overrides))
}

/// Guest directory the standard library is mounted at
pub const STDLIB_GUEST_PATH: &str = "/lib";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no guest module configured (set `module_path`)")]
    MissingModule,
}

/// Config for Coilbox
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interpreter module to compile and run
    #[serde(default)]
    pub module_path: Option<PathBuf>,

    /// Host directory mounted read-only at [`STDLIB_GUEST_PATH`]
    #[serde(default)]
    pub stdlib_path: Option<PathBuf>,

    /// Compiled artifact cache file. Caching is disabled when unset.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Guest directory for the interpreter's bytecode cache
    #[serde(default)]
    pub bytecode_cache_dir: Option<String>,

    /// argv[0] passed to the guest
    #[serde(default = "default_program_name")]
    pub program_name: String,

    /// Default resource limits applied to all sandboxes.
    /// Fields left out keep the built-in ceilings. Overridden field by field
    /// by per-run limits.
    #[serde(default, deserialize_with = "limits_over_builtin")]
    pub default_limits: ResourceLimits,

    /// Guest environment variables applied to all sandboxes
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Host directory mounts applied to all sandboxes
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with default limits and no paths
    pub fn empty() -> Self {
        Self {
            module_path: None,
            stdlib_path: None,
            cache_path: None,
            bytecode_cache_dir: None,
            program_name: default_program_name(),
            default_limits: ResourceLimits::default(),
            env: BTreeMap::new(),
            sandbox_mounts: Vec::new(),
        }
    }

    /// The configured guest module, or [`ConfigError::MissingModule`]
    pub fn require_module(&self) -> Result<&Path, ConfigError> {
        self.module_path
            .as_deref()
            .ok_or(ConfigError::MissingModule)
    }

    /// Read-only mount for the standard library, if configured
    pub fn stdlib_mount(&self) -> Option<MountConfig> {
        self.stdlib_path.as_ref().map(|path| {
            MountConfig::read_only(path.to_string_lossy(), STDLIB_GUEST_PATH)
        })
    }

    /// Standard library mount followed by the configured sandbox mounts
    pub fn all_mounts(&self) -> Vec<MountConfig> {
        self.stdlib_mount()
            .into_iter()
            .chain(self.sandbox_mounts.iter().cloned())
            .collect()
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        match overrides {
            Some(limits) => self.default_limits.with_overrides(limits),
            None => self.default_limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_program_name() -> String {
    DEFAULT_PROGRAM_NAME.to_string()
}
