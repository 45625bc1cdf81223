use std::time::{Duration, Instant};

use coilbox::controller::ControllerError;
use coilbox::runner::run_to_completion;
use coilbox::sandbox::SandboxBuilder;
use coilbox::types::{Completion, ExecutionState, SuspendReason};

use super::{compile_guest, controller};

#[test]
fn test_yields_suspend_and_resume() {
    let mut controller = controller("yield_three", SandboxBuilder::new());
    assert!(controller.is_async_capable());
    assert_eq!(controller.state(), ExecutionState::NotStarted);

    for _ in 0..3 {
        assert_eq!(controller.run().expect("run failed"), None);
        assert!(controller.is_suspended());
        assert_eq!(controller.suspended_reason(), Some(SuspendReason::Yield));
    }

    assert_eq!(controller.run().expect("run failed"), Some(9));
    assert!(controller.is_completed());
    assert_eq!(controller.completion(), Some(Completion::Exited(9)));
    assert_eq!(controller.runs(), 4);
}

#[test]
fn test_unwind_buffer_allocated_once() {
    let mut controller = controller("yield_three", SandboxBuilder::new());
    let initial = controller.memory_bytes();

    controller.run().expect("run failed");
    let after_first = controller.memory_bytes();
    assert_eq!(after_first, initial + 1024 * 1024);

    controller.run().expect("run failed");
    assert_eq!(controller.memory_bytes(), after_first);
}

#[test]
fn test_run_after_completion_is_rejected() {
    let mut controller = controller("yield_three", SandboxBuilder::new());
    while controller.run().expect("run failed").is_none() {}

    let error = controller.run().unwrap_err();
    assert!(matches!(error, ControllerError::Completed { exit_code: 9 }));
    assert!(error.is_invalid_state());
    assert_eq!(controller.runs(), 4);
}

#[test]
fn test_sleep_reports_timed_wait() {
    let mut controller = controller("sleep", SandboxBuilder::new());

    assert_eq!(controller.run().expect("run failed"), None);
    assert_eq!(
        controller.suspended_reason(),
        Some(SuspendReason::TimedWait(Duration::from_millis(5)))
    );

    // The guest checks the event it gets back after the rewind
    assert_eq!(controller.run().expect("run failed"), Some(11));
}

#[test]
fn test_non_async_guest_passes_through() {
    let mut controller = controller("sleep_passthrough", SandboxBuilder::new());
    assert!(!controller.is_async_capable());

    assert_eq!(controller.run().expect("run failed"), Some(11));
    assert_eq!(controller.runs(), 1);
}

#[test]
fn test_async_capability_detected_from_exports() {
    let (_, artifact) = compile_guest("yield_three");
    assert!(artifact.is_async_capable());

    let (_, artifact) = compile_guest("sleep_passthrough");
    assert!(!artifact.is_async_capable());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_to_completion_sleeps() {
    let mut controller = controller("sleep", SandboxBuilder::new());

    let started = Instant::now();
    let exit_code = run_to_completion(&mut controller)
        .await
        .expect("run_to_completion failed");

    assert_eq!(exit_code, 11);
    assert!(started.elapsed() >= Duration::from_millis(5));
    assert_eq!(controller.runs(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_to_completion_yields() {
    let mut controller = controller("yield_three", SandboxBuilder::new());
    let exit_code = run_to_completion(&mut controller)
        .await
        .expect("run_to_completion failed");
    assert_eq!(exit_code, 9);
    controller.dispose();
}
