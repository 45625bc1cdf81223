//! Compiles the configured interpreter once and runs sandboxes against it
//!
//! [`Runner`] loads the module through the artifact cache and seeds each
//! sandbox from the configuration. [`run_to_completion`] drives a
//! controller, sleeping through timed waits, until the guest finishes.

use thiserror::Error;
use tracing::{info, instrument, trace};
use wasmtime::Engine;

use crate::artifact::{
    ArtifactError, BytesLoader, CacheStatus, CompiledArtifact, FileCache, new_engine,
};
use crate::config::{Config, ConfigError};
use crate::controller::{ControllerError, ExecutionController};
use crate::runtime::GuestSession;
use crate::sandbox::{SandboxBuilder, SandboxConfig, SandboxError};
use crate::types::SuspendReason;

/// Errors that occur while preparing or driving a run
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("execution error: {0}")]
    Controller(#[from] ControllerError),
}

impl RunnerError {
    /// Check if the guest ran out of fuel or hit a memory/table ceiling
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, RunnerError::Controller(error) if error.is_resource_exhaustion())
    }
}

/// High-level runner: one engine and one compiled interpreter shared by
/// every sandbox it creates
#[derive(Clone)]
pub struct Runner {
    config: Config,
    engine: Engine,
    artifact: CompiledArtifact,
    cache_status: CacheStatus,
}

impl Runner {
    /// Compile (or fetch from the artifact cache) the configured module
    #[instrument(skip(config), fields(module = ?config.module_path, cache = ?config.cache_path))]
    pub fn new(config: Config) -> Result<Self, RunnerError> {
        let module_path = config.require_module()?;
        let engine = new_engine()?;
        let loader = FileCache::new(
            config.cache_path.clone(),
            BytesLoader::from_file(module_path)?,
        );
        let (artifact, cache_status) = loader.load_with_status(&engine)?;
        info!(?cache_status, "guest module ready");

        Ok(Self {
            config,
            engine,
            artifact,
            cache_status,
        })
    }

    /// Build a runner around an artifact that is already compiled for `engine`
    pub fn from_parts(config: Config, engine: Engine, artifact: CompiledArtifact) -> Self {
        Self {
            config,
            engine,
            artifact,
            cache_status: CacheStatus::Disabled,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    /// How the artifact cache satisfied [`Runner::new`]
    pub fn cache_status(&self) -> CacheStatus {
        self.cache_status
    }

    /// Sandbox builder seeded from the configuration: default limits,
    /// environment, mounts (standard library first), bytecode cache
    /// directory and program name
    pub fn sandbox(&self) -> SandboxBuilder {
        let mut builder = SandboxBuilder::new()
            .program_name(&self.config.program_name)
            .limits(self.config.default_limits.clone())
            .envs(self.config.env.clone())
            .mounts(self.config.all_mounts());
        if let Some(ref dir) = self.config.bytecode_cache_dir {
            builder = builder.bytecode_cache_dir(dir);
        }
        builder
    }

    /// Instantiate a sandbox and wrap it in a controller
    pub fn instantiate(&self, sandbox: SandboxConfig) -> Result<ExecutionController, RunnerError> {
        let session = sandbox.instantiate(&self.engine, &self.artifact)?;
        Ok(ExecutionController::new(session))
    }

    /// Instantiate a sandbox and drive it to completion with
    /// [`run_to_completion`]
    pub async fn run(&self, sandbox: SandboxConfig) -> Result<i32, RunnerError> {
        let mut controller = self.instantiate(sandbox)?;
        let exit_code = run_to_completion(&mut controller).await?;
        controller.dispose();
        Ok(exit_code)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("artifact", &self.artifact)
            .field("cache_status", &self.cache_status)
            .finish()
    }
}

/// Call `run()` until the guest completes, waiting out each suspension:
/// a timed wait sleeps for its duration and a yield gives other tasks a turn.
///
/// Guest code runs on the calling worker thread through
/// [`tokio::task::block_in_place`], so this needs the multi-thread runtime.
pub async fn run_to_completion<S: GuestSession>(
    controller: &mut ExecutionController<S>,
) -> Result<i32, ControllerError> {
    loop {
        if let Some(exit_code) = tokio::task::block_in_place(|| controller.run())? {
            return Ok(exit_code);
        }
        match controller.suspended_reason() {
            Some(SuspendReason::TimedWait(duration)) => {
                trace!(?duration, "guest waiting");
                tokio::time::sleep(duration).await;
            }
            Some(SuspendReason::Yield) | None => tokio::task::yield_now().await,
        }
    }
}
