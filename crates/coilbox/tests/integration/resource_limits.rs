use coilbox::controller::ControllerError;
use coilbox::runtime::RuntimeFault;
use coilbox::sandbox::SandboxBuilder;
use coilbox::types::{ExecutionState, LimitExceeded, ResourceLimits};

use super::controller;

#[test]
fn test_zero_fuel_exhausts_immediately() {
    let mut controller = controller("spin", SandboxBuilder::new().fuel(0));

    let error = controller.run().unwrap_err();
    assert!(error.is_resource_exhaustion());
    assert!(matches!(
        error,
        ControllerError::Fault(RuntimeFault::ResourceExhausted(LimitExceeded::Fuel))
    ));
    assert_eq!(controller.state(), ExecutionState::Faulted);
    assert_eq!(controller.fuel(), 0);
}

#[test]
fn test_spinning_guest_runs_out_of_fuel() {
    let mut controller = controller("spin", SandboxBuilder::new().fuel(100_000));
    let error = controller.run().unwrap_err();
    assert!(error.is_resource_exhaustion());
    assert_eq!(controller.fuel(), 0);
}

#[test]
fn test_faulted_controller_is_poisoned() {
    let mut controller = controller("spin", SandboxBuilder::new().fuel(1_000));
    controller.run().unwrap_err();

    let error = controller.run().unwrap_err();
    assert!(matches!(error, ControllerError::Poisoned));
    assert!(error.is_invalid_state());
    assert_eq!(controller.runs(), 1);
}

#[test]
fn test_refuel_between_runs() {
    let mut controller = controller("yield_three", SandboxBuilder::new().fuel(1_000_000));
    assert_eq!(controller.run().unwrap(), None);

    controller.set_fuel(42_000).unwrap();
    assert_eq!(controller.fuel(), 42_000);
    assert_eq!(controller.run().unwrap(), None);
    assert!(controller.fuel() < 42_000);
}

#[test]
fn test_memory_ceiling() {
    let mut controller = controller(
        "grow_memory",
        SandboxBuilder::new().memory_limit(2 * ResourceLimits::MB),
    );

    let error = controller.run().unwrap_err();
    assert!(error.is_resource_exhaustion());
    assert!(matches!(
        error,
        ControllerError::Fault(RuntimeFault::ResourceExhausted(LimitExceeded::Memory { .. }))
    ));
}

#[test]
fn test_memory_growth_within_limit() {
    let mut controller = controller(
        "grow_memory",
        SandboxBuilder::new().memory_limit(8 * ResourceLimits::MB),
    );
    assert_eq!(controller.run().unwrap(), Some(0));
    assert_eq!(controller.memory_bytes(), 65 * 64 * ResourceLimits::KB);
}

#[test]
fn test_unwind_buffer_counts_against_memory_ceiling() {
    let mut controller = controller(
        "yield_three",
        SandboxBuilder::new().memory_limit(ResourceLimits::MB),
    );
    let error = controller.run().unwrap_err();
    assert!(error.is_resource_exhaustion());
}
