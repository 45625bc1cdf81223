//! Sandbox configuration and instantiation
//!
//! A [`SandboxBuilder`] collects program bytes, limits, providers and
//! filesystem contents into an immutable [`SandboxConfig`], which is
//! consumed once to instantiate a [`WasmSession`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};
use wasmtime::{Engine, Linker};
use wasmtime_wasi::WasiCtxBuilder;

pub use crate::sandbox::environment::{
    DEFAULT_MAIN_FILE, DEFAULT_PROGRAM_NAME, LaunchMode, guest_env,
};
pub use crate::sandbox::filesystem::{
    FsEntry, Preopen, ROOT_GUEST_PATH, SCRATCH_DIR, VirtualRoot, validate_mounts,
};
pub use crate::sandbox::providers::{
    ClockSource, InputSource, ManualClock, NetworkPolicy, OutputCapture, OutputSink,
    RandomSource,
};
pub(crate) use crate::sandbox::providers::SessionClock;
use crate::artifact::CompiledArtifact;
use crate::runtime::{ENTRY_POINT, GuestState, WasmSession};
use crate::types::{MountConfig, ResourceLimits};

mod environment;
mod filesystem;
mod providers;

/// Errors raised while assembling or instantiating a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("guest module is missing required export `{0}`")]
    MissingExport(&'static str),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to preopen {guest_path}: {source}")]
    Preopen {
        guest_path: String,
        #[source]
        source: wasmtime::Error,
    },

    #[error("failed to link host capabilities: {0}")]
    Link(#[source] wasmtime::Error),

    #[error("failed to instantiate guest module: {0}")]
    Instantiate(#[source] wasmtime::Error),

    #[error("engine does not meter fuel: {0}")]
    FuelUnavailable(#[source] wasmtime::Error),
}

type ExtendLinker = dyn Fn(&mut Linker<GuestState>) -> wasmtime::Result<()> + Send + Sync;

/// Extra host functions defined on the guest linker.
///
/// Runs after the WASI imports and suspend points are defined, so it can add
/// new imports but not replace built-in ones.
#[derive(Clone)]
pub struct LinkerExtension(Arc<ExtendLinker>);

impl LinkerExtension {
    pub fn new(
        extend: impl Fn(&mut Linker<GuestState>) -> wasmtime::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(extend))
    }

    pub(crate) fn apply(&self, linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
        (self.0)(linker)
    }
}

impl fmt::Debug for LinkerExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkerExtension(..)")
    }
}

/// Everything one sandbox session is built from.
///
/// Produced by [`SandboxBuilder::build`] and consumed by
/// [`SandboxConfig::instantiate`]; there are no setters.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    program: Option<Vec<u8>>,
    main_path: Option<String>,
    program_name: String,
    limits: ResourceLimits,
    clock: ClockSource,
    random: RandomSource,
    network: NetworkPolicy,
    stdin: InputSource,
    stdout: OutputSink,
    stderr: OutputSink,
    env: BTreeMap<String, String>,
    filesystem: Vec<FsEntry>,
    mounts: Vec<MountConfig>,
    bytecode_cache_dir: Option<String>,
    linker: Vec<LinkerExtension>,
}

impl SandboxConfig {
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    pub fn program(&self) -> Option<&[u8]> {
        self.program.as_deref()
    }

    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    pub fn launch_mode(&self) -> LaunchMode {
        LaunchMode::select(self.program.is_some(), self.main_path.as_deref())
    }

    /// Guest argv derived from the launch mode
    pub fn argv(&self) -> Vec<String> {
        self.launch_mode().argv(&self.program_name)
    }

    /// Guest environment including interpreter defaults
    pub fn env(&self) -> BTreeMap<String, String> {
        guest_env(&self.env, self.bytecode_cache_dir.as_deref())
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn filesystem(&self) -> &[FsEntry] {
        &self.filesystem
    }

    pub fn mounts(&self) -> &[MountConfig] {
        &self.mounts
    }

    pub fn network(&self) -> NetworkPolicy {
        self.network
    }

    pub fn bytecode_cache_dir(&self) -> Option<&str> {
        self.bytecode_cache_dir.as_deref()
    }

    pub fn linker_extensions(&self) -> &[LinkerExtension] {
        &self.linker
    }

    /// Build the scratch filesystem and capabilities, then instantiate
    /// `artifact` against them.
    ///
    /// Fails before touching the filesystem if the module has no entry point.
    #[instrument(skip_all, fields(mode = ?self.launch_mode()))]
    pub fn instantiate(
        self,
        engine: &Engine,
        artifact: &CompiledArtifact,
    ) -> Result<WasmSession, SandboxError> {
        if !artifact.exports_function(ENTRY_POINT) {
            return Err(SandboxError::MissingExport(ENTRY_POINT));
        }

        let mode = self.launch_mode();
        let mounts = validate_mounts(&self.mounts)?;

        let mut root = VirtualRoot::create()?;
        root.create_dir(SCRATCH_DIR)?;
        if let Some(dir) = &self.bytecode_cache_dir {
            root.create_dir(dir)?;
        }
        if let (Some(program), Some(path)) = (&self.program, mode.main_path()) {
            root.write_file(path, program, true)?;
        }
        for entry in &self.filesystem {
            root.apply(entry)?;
        }

        let mut wasi = WasiCtxBuilder::new();
        wasi.args(mode.argv(&self.program_name).as_slice());
        for (key, value) in self.env() {
            wasi.env(key, value);
        }
        self.stdin.apply(&mut wasi);
        self.stdout.apply_stdout(&mut wasi);
        self.stderr.apply_stderr(&mut wasi);

        let clock = self.clock.session_clock();
        wasi.wall_clock(clock.clone());
        wasi.monotonic_clock(clock.clone());
        self.random.apply(&mut wasi);
        self.network.apply(&mut wasi);
        root.preopen(&mut wasi, &mounts)?;

        debug!(
            mounts = mounts.len(),
            entries = self.filesystem.len(),
            "assembled sandbox capabilities"
        );
        WasmSession::new(
            engine,
            artifact,
            wasi.build_p1(),
            root,
            &self.limits,
            clock,
            &self.linker,
        )
    }
}

/// Staged builder for [`SandboxConfig`]
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    config: SandboxConfig,
}

impl SandboxBuilder {
    /// Builder with every field at its default
    pub fn new() -> Self {
        Self {
            config: SandboxConfig {
                program: None,
                main_path: None,
                program_name: DEFAULT_PROGRAM_NAME.to_string(),
                limits: ResourceLimits::default(),
                clock: ClockSource::default(),
                random: RandomSource::default(),
                network: NetworkPolicy::default(),
                stdin: InputSource::default(),
                stdout: OutputSink::default(),
                stderr: OutputSink::default(),
                env: BTreeMap::new(),
                filesystem: Vec::new(),
                mounts: Vec::new(),
                bytecode_cache_dir: None,
                linker: Vec::new(),
            },
        }
    }

    /// Set the guest program source, selecting run-file mode
    pub fn program(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.config.program = Some(bytes.into());
        self
    }

    /// Set the guest path the program runs from
    pub fn main_path(mut self, path: impl Into<String>) -> Self {
        self.config.main_path = Some(path.into());
        self
    }

    /// Set argv[0]
    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.config.program_name = name.into();
        self
    }

    /// Replace all resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the instruction budget
    pub fn fuel(mut self, fuel: u64) -> Self {
        self.config.limits.fuel = Some(fuel);
        self
    }

    /// Set the linear memory ceiling in bytes
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.limits.memory_bytes = Some(bytes);
        self
    }

    pub fn clock(mut self, clock: ClockSource) -> Self {
        self.config.clock = clock;
        self
    }

    pub fn random(mut self, random: RandomSource) -> Self {
        self.config.random = random;
        self
    }

    pub fn network(mut self, network: NetworkPolicy) -> Self {
        self.config.network = network;
        self
    }

    pub fn stdin(mut self, stdin: InputSource) -> Self {
        self.config.stdin = stdin;
        self
    }

    pub fn stdout(mut self, stdout: OutputSink) -> Self {
        self.config.stdout = stdout;
        self
    }

    pub fn stderr(mut self, stderr: OutputSink) -> Self {
        self.config.stderr = stderr;
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.config
            .env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add a filesystem mutation
    pub fn fs_entry(mut self, entry: FsEntry) -> Self {
        self.config.filesystem.push(entry);
        self
    }

    /// Add a writable file
    pub fn file(self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.fs_entry(FsEntry::file(path, contents))
    }

    /// Add a directory
    pub fn dir(self, path: impl Into<String>) -> Self {
        self.fs_entry(FsEntry::dir(path))
    }

    /// Add a host directory mount
    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.config.mounts.push(mount);
        self
    }

    /// Add multiple host directory mounts
    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.config.mounts.extend(mounts);
        self
    }

    /// Enable guest bytecode caching under this guest directory
    pub fn bytecode_cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.bytecode_cache_dir = Some(dir.into());
        self
    }

    /// Define extra host functions for the guest to import.
    ///
    /// Extensions run in the order they were added.
    pub fn linker(
        mut self,
        extend: impl Fn(&mut Linker<GuestState>) -> wasmtime::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.config.linker.push(LinkerExtension::new(extend));
        self
    }

    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}
