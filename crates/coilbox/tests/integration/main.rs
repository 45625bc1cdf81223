//! Integration tests for coilbox
//!
//! Guests are small hand-written WAT modules under `tests/fixtures/guests`.
//! The async-capable ones export the five asyncify entry points themselves
//! and keep their progress in globals, which is enough to exercise the
//! host side of the unwind/rewind protocol.

use std::fs;

use coilbox::artifact::{CompiledArtifact, new_engine};
use coilbox::controller::ExecutionController;
use coilbox::runtime::WasmSession;
use coilbox::sandbox::SandboxBuilder;
use wasmtime::Engine;

mod config_loading;
mod resource_limits;
mod runner;
mod sandbox_io;
mod suspension;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get a guest module's WAT source
pub(crate) fn guest_source(name: &str) -> Vec<u8> {
    let path = format!("{FIXTURES_PATH}/guests/{name}.wat");
    fs::read(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Compile a guest fixture on a fresh engine
pub(crate) fn compile_guest(name: &str) -> (Engine, CompiledArtifact) {
    let engine = new_engine().expect("Failed to create engine");
    let artifact =
        CompiledArtifact::compile(&engine, &guest_source(name)).expect("Failed to compile guest");
    (engine, artifact)
}

/// Instantiate a guest fixture in a sandbox built from `builder`
pub(crate) fn controller(name: &str, builder: SandboxBuilder) -> ExecutionController<WasmSession> {
    let (engine, artifact) = compile_guest(name);
    let session = builder
        .build()
        .instantiate(&engine, &artifact)
        .expect("Failed to instantiate guest");
    ExecutionController::new(session)
}
