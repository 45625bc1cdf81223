use std::fs;

use coilbox::artifact::CacheStatus;
use coilbox::config::Config;
use coilbox::runner::Runner;
use coilbox::sandbox::{OutputCapture, OutputSink};

use super::{FIXTURES_PATH, guest_source};

fn guest_config(name: &str) -> Config {
    Config {
        module_path: Some(format!("{FIXTURES_PATH}/guests/{name}.wat").into()),
        ..Config::empty()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runner_runs_async_guest() {
    let runner = Runner::new(guest_config("yield_three")).expect("Failed to create runner");
    assert_eq!(runner.cache_status(), CacheStatus::Disabled);
    assert!(runner.artifact().is_async_capable());

    let exit_code = runner
        .run(runner.sandbox().build())
        .await
        .expect("Execution failed");
    assert_eq!(exit_code, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runner_reuses_artifact_across_sandboxes() {
    let runner = Runner::new(guest_config("echo")).expect("Failed to create runner");

    for input in ["first", "second"] {
        let stdout = OutputCapture::new();
        let sandbox = runner
            .sandbox()
            .stdin(coilbox::InputSource::Bytes(input.as_bytes().to_vec()))
            .stdout(OutputSink::Capture(stdout.clone()))
            .build();
        assert_eq!(runner.run(sandbox).await.unwrap(), 0);
        assert_eq!(stdout.to_string_lossy(), input);
    }
}

#[test]
fn test_artifact_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("guest.wat");
    fs::write(&module, guest_source("hello")).unwrap();
    let config = Config {
        module_path: Some(module.clone()),
        cache_path: Some(dir.path().join("cache/guest.cwasm")),
        ..Config::empty()
    };

    assert_eq!(
        Runner::new(config.clone()).unwrap().cache_status(),
        CacheStatus::Miss
    );
    assert_eq!(
        Runner::new(config.clone()).unwrap().cache_status(),
        CacheStatus::Hit
    );

    // A different module under the same cache path is recompiled
    fs::write(&module, guest_source("echo")).unwrap();
    assert_eq!(
        Runner::new(config).unwrap().cache_status(),
        CacheStatus::Invalidated
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stdlib_mounted_at_lib() {
    let stdlib = tempfile::tempdir().unwrap();
    fs::write(stdlib.path().join("hello.txt"), "from stdlib\n").unwrap();

    // cat_data reads hello.txt from the first mount, fd 4
    let config = Config {
        stdlib_path: Some(stdlib.path().to_path_buf()),
        ..guest_config("cat_data")
    };
    let runner = Runner::new(config).unwrap();
    let stdout = OutputCapture::new();
    let sandbox = runner
        .sandbox()
        .stdout(OutputSink::Capture(stdout.clone()))
        .build();

    assert_eq!(runner.run(sandbox).await.unwrap(), 0);
    assert_eq!(stdout.to_string_lossy(), "from stdlib\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runner_reports_missing_entry_point() {
    let runner = Runner::new(guest_config("no_start")).unwrap();
    let error = runner.run(runner.sandbox().build()).await.unwrap_err();
    assert!(matches!(error, coilbox::RunnerError::Sandbox(_)));
}
