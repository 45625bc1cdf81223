//! End-to-end tests against a real asyncify-built CPython
//!
//! Needs the interpreter module and its standard library:
//!    COILBOX_PYTHON_WASM=/path/to/python.wasm \
//!    COILBOX_PYTHON_LIB=/path/to/lib \
//!    cargo test -p coilbox --features python-tests --test python

#![cfg(feature = "python-tests")]

use std::time::Duration;

use coilbox::config::Config;
use coilbox::runner::{Runner, run_to_completion};
use coilbox::sandbox::{InputSource, OutputCapture, OutputSink};
use coilbox::types::SuspendReason;

fn python_runner() -> Runner {
    let module = std::env::var("COILBOX_PYTHON_WASM").expect("COILBOX_PYTHON_WASM not set");
    let stdlib = std::env::var("COILBOX_PYTHON_LIB").expect("COILBOX_PYTHON_LIB not set");
    let config = Config {
        module_path: Some(module.into()),
        stdlib_path: Some(stdlib.into()),
        ..Config::empty()
    };
    Runner::new(config).expect("Failed to load interpreter")
}

async fn run_python(runner: &Runner, source: &str, stdin: &str) -> (i32, String, String) {
    let stdout = OutputCapture::new();
    let stderr = OutputCapture::new();
    let sandbox = runner
        .sandbox()
        .program(source)
        .stdin(InputSource::Bytes(stdin.as_bytes().to_vec()))
        .stdout(OutputSink::Capture(stdout.clone()))
        .stderr(OutputSink::Capture(stderr.clone()))
        .build();
    let exit_code = runner.run(sandbox).await.expect("Execution failed");
    (exit_code, stdout.to_string_lossy(), stderr.to_string_lossy())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hello_world() {
    let runner = python_runner();
    let (exit_code, stdout, _) = run_python(&runner, "print('Hello, World!')", "").await;
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, "Hello, World!\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reads_stdin() {
    let runner = python_runner();
    let (_, stdout, _) = run_python(&runner, "print(input()[::-1])", "abc\n").await;
    assert_eq!(stdout, "cba\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uncaught_exception_exits_nonzero() {
    let runner = python_runner();
    let (exit_code, _, stderr) = run_python(&runner, "raise ValueError('boom')", "").await;
    assert_eq!(exit_code, 1);
    assert!(stderr.contains("ValueError: boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sys_exit_code() {
    let runner = python_runner();
    let (exit_code, _, _) = run_python(&runner, "import sys; sys.exit(3)", "").await;
    assert_eq!(exit_code, 3);
}

#[test]
fn test_sleep_suspends() {
    let runner = python_runner();
    let sandbox = runner
        .sandbox()
        .program("import time\ntime.sleep(0.25)\nprint('awake')")
        .build();
    let mut controller = runner.instantiate(sandbox).unwrap();
    assert!(controller.is_async_capable());

    let mut waits = Vec::new();
    while controller.run().unwrap().is_none() {
        if let Some(SuspendReason::TimedWait(duration)) = controller.suspended_reason() {
            waits.push(duration);
        }
    }
    // Relative or absolute deadlines both come out at or under the request
    assert!(
        waits
            .iter()
            .any(|wait| *wait > Duration::ZERO && *wait <= Duration::from_millis(250))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runs_to_completion_after_sleep() {
    let runner = python_runner();
    let sandbox = runner
        .sandbox()
        .program("import time\ntime.sleep(0.01)\nprint('done')")
        .build();
    let mut controller = runner.instantiate(sandbox).unwrap();
    assert_eq!(run_to_completion(&mut controller).await.unwrap(), 0);
}
