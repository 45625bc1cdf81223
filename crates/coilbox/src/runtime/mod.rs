//! Guest runtime boundary
//!
//! [`GuestSession`] is the primitive the controller drives: run until the
//! guest returns, exits, faults or asks to pause. [`WasmSession`] implements
//! it on wasmtime.

use thiserror::Error;

pub use crate::runtime::limiter::SessionLimiter;
pub use crate::runtime::wasm::{GuestState, WasmSession};
use crate::types::{LimitExceeded, SuspendReason};

mod asyncify;
mod limiter;
mod wasm;

/// Exported function every guest must provide
pub const ENTRY_POINT: &str = "_start";

/// Exported linear memory every guest must provide
pub const MEMORY_EXPORT: &str = "memory";

/// How one entry point invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// Returned without exiting or suspending
    Returned,
    /// The guest requested process exit
    Exited(i32),
    /// The guest paused at a suspend point
    Suspended(SuspendReason),
}

/// Opaque handle to a captured execution point.
///
/// Only the session that issued it knows what it refers to. It is not
/// `Clone`, so each capture can be restored at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct ResumeToken {
    slot: u64,
}

impl ResumeToken {
    /// Wrap a session-specific slot identifier
    pub fn new(slot: u64) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// Faults raised by a running guest
#[derive(Debug, Error)]
pub enum RuntimeFault {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(LimitExceeded),

    #[error("guest trapped: {0}")]
    Trap(String),

    #[error("suspend protocol violated: {0}")]
    Protocol(String),
}

impl RuntimeFault {
    /// Check if the fault came from an exhausted budget or ceiling
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, RuntimeFault::ResourceExhausted(_))
    }

    /// The ceiling that was hit, if any
    pub fn limit(&self) -> Option<LimitExceeded> {
        match self {
            RuntimeFault::ResourceExhausted(limit) => Some(*limit),
            _ => None,
        }
    }
}

/// One instantiated guest, driven by an execution controller.
///
/// Calls are serialized by the owner; nothing here is reentrant.
pub trait GuestSession {
    /// Whether the guest can pause at suspend points at all
    fn is_async_capable(&self) -> bool;

    /// Call the entry point. When resuming, the execution point must have
    /// been restored first.
    fn invoke_entry_point(&mut self) -> Result<InvokeOutcome, RuntimeFault>;

    /// Capture the paused execution point. Only legal directly after
    /// [`InvokeOutcome::Suspended`].
    fn capture_execution_point(&mut self) -> Result<ResumeToken, RuntimeFault>;

    /// Arrange for the next invocation to continue from `token`
    fn restore_execution_point(&mut self, token: ResumeToken) -> Result<(), RuntimeFault>;

    /// Current guest linear memory size in bytes
    fn memory_bytes(&self) -> u64;

    /// Remaining instruction budget
    fn fuel(&self) -> u64;

    fn set_fuel(&mut self, fuel: u64) -> Result<(), RuntimeFault>;
}
