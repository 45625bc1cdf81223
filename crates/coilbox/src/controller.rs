//! Resumable execution of one sandbox session
//!
//! [`ExecutionController`] turns the session's "run until it returns, exits,
//! faults or pauses" primitive into a state machine: each [`run`] either
//! completes the guest with an exit code or leaves it suspended with a
//! reason, and the next [`run`] resumes exactly where it paused.
//!
//! [`run`]: ExecutionController::run

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::runtime::{GuestSession, InvokeOutcome, ResumeToken, RuntimeFault, WasmSession};
use crate::types::{Completion, ExecutionState, SuspendReason};

/// Errors returned by [`ExecutionController`]
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The guest already finished; discard the controller
    #[error("session already completed with exit code {exit_code}")]
    Completed { exit_code: i32 },

    /// An earlier run faulted; discard the controller
    #[error("session is unusable after an earlier fault")]
    Poisoned,

    /// The guest faulted during this run
    #[error(transparent)]
    Fault(#[from] RuntimeFault),
}

impl ControllerError {
    /// Check if this is an invalid-state error (no guest code ran)
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            ControllerError::Completed { .. } | ControllerError::Poisoned
        )
    }

    /// Check if the guest ran out of fuel or hit a memory/table ceiling
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, ControllerError::Fault(fault) if fault.is_resource_exhaustion())
    }
}

/// Owns one guest session and drives it across suspensions.
///
/// Not reentrant: `run` takes `&mut self`, so calls are serialized by the
/// borrow checker. Dropping the controller (or calling [`dispose`]) releases
/// the session and its scratch filesystem.
///
/// [`dispose`]: ExecutionController::dispose
#[derive(Debug)]
pub struct ExecutionController<S: GuestSession = WasmSession> {
    session: S,
    state: ExecutionState,
    resume: Option<ResumeToken>,
    runs: u64,
}

impl<S: GuestSession> ExecutionController<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            state: ExecutionState::NotStarted,
            resume: None,
            runs: 0,
        }
    }

    /// Run the guest until it completes or suspends.
    ///
    /// Returns the exit code on completion and `None` on suspension; see
    /// [`suspended_reason`](Self::suspended_reason) for why it paused. A
    /// plain return from the entry point completes with exit code 0.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Completed`] or [`ControllerError::Poisoned`] if the
    /// session can no longer run; nothing is executed in that case.
    /// [`ControllerError::Fault`] if the guest faulted, including running out
    /// of fuel or memory. Faults are never retried and leave the controller
    /// poisoned.
    #[instrument(skip(self), fields(run = self.runs + 1))]
    pub fn run(&mut self) -> Result<Option<i32>, ControllerError> {
        match self.state {
            ExecutionState::Completed(completion) => {
                return Err(ControllerError::Completed {
                    exit_code: completion.exit_code(),
                });
            }
            ExecutionState::Faulted => return Err(ControllerError::Poisoned),
            ExecutionState::NotStarted | ExecutionState::Suspended(_) => {}
        }

        self.runs += 1;
        let fuel_before = self.session.fuel();
        let result = self.step();
        let fuel_consumed = fuel_before.saturating_sub(self.session.fuel());

        match &result {
            Ok(_) => debug!(
                fuel_consumed,
                memory_bytes = self.session.memory_bytes(),
                state = ?self.state,
                "run finished"
            ),
            Err(error) => {
                self.state = ExecutionState::Faulted;
                self.resume = None;
                warn!(fuel_consumed, %error, "run faulted");
            }
        }
        result
    }

    fn step(&mut self) -> Result<Option<i32>, ControllerError> {
        if let Some(token) = self.resume.take() {
            self.session.restore_execution_point(token)?;
        }

        match self.session.invoke_entry_point()? {
            InvokeOutcome::Exited(code) => {
                self.state = ExecutionState::Completed(Completion::Exited(code));
                Ok(Some(code))
            }
            InvokeOutcome::Returned => {
                self.state = ExecutionState::Completed(Completion::Returned);
                Ok(Some(Completion::Returned.exit_code()))
            }
            InvokeOutcome::Suspended(reason) => {
                self.resume = Some(self.session.capture_execution_point()?);
                self.state = ExecutionState::Suspended(reason);
                Ok(None)
            }
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Whether the guest can pause at all. Fixed for the session's lifetime.
    pub fn is_async_capable(&self) -> bool {
        self.session.is_async_capable()
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, ExecutionState::Suspended(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, ExecutionState::Completed(_))
    }

    /// Why the guest paused; `None` unless currently suspended
    pub fn suspended_reason(&self) -> Option<SuspendReason> {
        match self.state {
            ExecutionState::Suspended(reason) => Some(reason),
            _ => None,
        }
    }

    /// How the guest finished; `None` unless completed
    pub fn completion(&self) -> Option<Completion> {
        match self.state {
            ExecutionState::Completed(completion) => Some(completion),
            _ => None,
        }
    }

    /// Remaining instruction budget
    pub fn fuel(&self) -> u64 {
        self.session.fuel()
    }

    /// Replace the remaining instruction budget. Setting zero makes the next
    /// run fault deterministically.
    pub fn set_fuel(&mut self, fuel: u64) -> Result<(), ControllerError> {
        self.session.set_fuel(fuel)?;
        Ok(())
    }

    /// Current guest linear memory size in bytes
    pub fn memory_bytes(&self) -> u64 {
        self.session.memory_bytes()
    }

    /// Number of `run()` calls that reached the session
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Release the session and everything it owns
    pub fn dispose(self) {
        debug!(runs = self.runs, state = ?self.state, "disposing session");
    }
}
