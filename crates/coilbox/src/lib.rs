//! A library for running a sandboxed, suspendable script interpreter.
//!
//! Coilbox loads an asyncify-instrumented interpreter compiled to WebAssembly
//! (typically CPython for WASI), gives each run its own scratch filesystem,
//! stdio and clock, and drives execution through a controller that can pause
//! the guest whenever it sleeps or yields and resume it later.
//!
//! # Features
//!
//! - **Compiled artifact cache**: Fingerprinted on-disk cache of the compiled interpreter.
//! - **Virtual filesystem**: Per-sandbox temporary root plus read-only standard library mount.
//! - **Pluggable providers**: Stdin, stdout/stderr, clock and randomness chosen per sandbox.
//! - **Cooperative suspension**: Guest `sleep`/`sched_yield` unwind to the host and resume on the next run.
//! - **Host extensions**: Extra host functions linked in per sandbox.
//! - **Resource limits**: Fuel budgets plus memory and table ceilings reported as typed faults.
//! - **TOML configuration**: Module, standard library, cache and default limits in one file.

pub use artifact::{ArtifactError, CacheStatus, CompiledArtifact, FileCache, new_engine};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use controller::{ControllerError, ExecutionController};
pub use runner::{Runner, RunnerError, run_to_completion};
pub use runtime::{GuestSession, GuestState, RuntimeFault, WasmSession};
pub use sandbox::{
    ClockSource, FsEntry, InputSource, LinkerExtension, ManualClock, NetworkPolicy,
    OutputCapture, OutputSink, RandomSource, SandboxBuilder, SandboxConfig, SandboxError,
};
pub use types::{
    Completion, ExecutionState, LimitExceeded, MountConfig, ResourceLimits, SuspendReason,
};

pub mod artifact;
pub mod config;
pub mod controller;
pub mod runner;
pub mod runtime;
pub mod sandbox;
pub mod types;
