use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Instruction budget. Roughly one unit per executed wasm instruction.
    #[serde(default)]
    pub fuel: Option<u64>,

    /// Ceiling on guest linear memory in bytes
    #[serde(default)]
    pub memory_bytes: Option<u64>,

    /// Ceiling on elements in any single table
    #[serde(default)]
    pub table_elements: Option<u64>,

    /// Maximum number of instances in the store
    #[serde(default)]
    pub instances: Option<u32>,

    /// Maximum number of tables in the store
    #[serde(default)]
    pub tables: Option<u32>,

    /// Maximum number of linear memories in the store
    #[serde(default)]
    pub memories: Option<u32>,
}

impl ResourceLimits {
    /// 1 kilobyte in bytes
    pub const KB: u64 = 1024;
    /// 1 megabyte in bytes
    pub const MB: u64 = 1024 * 1024;

    /// Fuel given to a session when no budget is configured
    pub const DEFAULT_FUEL: u64 = 10_000_000_000;

    /// Create new resource limits with the default ceilings
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset; useful as an override layer
    pub fn unset() -> Self {
        Self {
            fuel: None,
            memory_bytes: None,
            table_elements: None,
            instances: None,
            tables: None,
            memories: None,
        }
    }

    /// Set the instruction budget
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Set the linear memory ceiling in bytes
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    /// Set the per-table element ceiling
    pub fn with_table_elements(mut self, elements: u64) -> Self {
        self.table_elements = Some(elements);
        self
    }

    /// Fuel to load into a fresh store
    pub fn effective_fuel(&self) -> u64 {
        self.fuel.unwrap_or(Self::DEFAULT_FUEL)
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    ///
    /// Returns a new ResourceLimits with values from `overrides` taking precedence
    /// over values from `self` when both are present.
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            fuel: overrides.fuel.or(self.fuel),
            memory_bytes: overrides.memory_bytes.or(self.memory_bytes),
            table_elements: overrides.table_elements.or(self.table_elements),
            instances: overrides.instances.or(self.instances),
            tables: overrides.tables.or(self.tables),
            memories: overrides.memories.or(self.memories),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            fuel: Some(Self::DEFAULT_FUEL),
            memory_bytes: Some(100_000_000),
            table_elements: Some(20_000),
            instances: Some(1),
            tables: Some(1),
            memories: Some(1),
        }
    }
}

/// Why a guest paused itself.
///
/// The guest only pauses at operations the host recognizes as suspend
/// points, so this set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// The guest is waiting on a timer or poll. Call `run()` again once the
    /// duration has elapsed.
    TimedWait(Duration),

    /// The guest yielded its time slice. `run()` may be called again
    /// immediately.
    Yield,
}

impl SuspendReason {
    /// How long the caller should wait before resuming
    pub fn delay(&self) -> Duration {
        match self {
            SuspendReason::TimedWait(duration) => *duration,
            SuspendReason::Yield => Duration::ZERO,
        }
    }
}

/// How a completed session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The guest called `proc_exit` with this code
    Exited(i32),

    /// The entry point returned without exiting or suspending
    Returned,
}

impl Completion {
    /// Exit code reported to the caller. A plain return counts as success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Completion::Exited(code) => *code,
            Completion::Returned => 0,
        }
    }
}

/// Lifecycle of a sandbox session as seen between `run()` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    /// `run()` has not been called yet
    #[default]
    NotStarted,

    /// The guest paused and can be resumed with another `run()`
    Suspended(SuspendReason),

    /// The guest finished; the session cannot run again
    Completed(Completion),

    /// A fault escaped the guest; the session must be discarded
    Faulted,
}

impl ExecutionState {
    /// Check if the state accepts another `run()`
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ExecutionState::NotStarted | ExecutionState::Suspended(_)
        )
    }
}

/// Which resource ceiling a guest ran into.
///
/// Also serves as the error the store limiter raises, so it can be
/// recovered from a wasmtime error by downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitExceeded {
    /// Instruction budget ran out
    #[error("instruction budget exhausted")]
    Fuel,

    /// Linear memory growth past the configured ceiling
    #[error("memory ceiling of {limit} bytes exceeded (requested {requested} bytes)")]
    Memory { requested: u64, limit: u64 },

    /// Table growth past the configured ceiling
    #[error("table ceiling of {limit} elements exceeded (requested {requested} elements)")]
    Table { requested: u64, limit: u64 },
}

/// Configuration for a host directory exposed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (skipped if the source doesn't exist)
    #[serde(default)]
    pub optional: bool,
}

impl MountConfig {
    /// A read-only, required mount
    pub fn read_only(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: false,
            optional: false,
        }
    }
}
