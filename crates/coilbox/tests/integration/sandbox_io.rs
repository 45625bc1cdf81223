use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coilbox::sandbox::{
    ClockSource, FsEntry, InputSource, ManualClock, OutputCapture, OutputSink, RandomSource,
    SandboxBuilder, SandboxError,
};
use coilbox::runtime::GuestState;
use coilbox::types::MountConfig;
use wasmtime::Caller;

use super::{compile_guest, controller};

fn run_captured(name: &str, builder: SandboxBuilder) -> (i32, OutputCapture) {
    let stdout = OutputCapture::new();
    let mut controller = controller(name, builder.stdout(OutputSink::Capture(stdout.clone())));
    let exit_code = controller
        .run()
        .expect("run failed")
        .expect("guest should not suspend");
    (exit_code, stdout)
}

#[test]
fn test_stdout_and_stderr_captured_separately() {
    let stdout = OutputCapture::new();
    let stderr = OutputCapture::new();
    let mut controller = controller(
        "hello",
        SandboxBuilder::new()
            .stdout(OutputSink::Capture(stdout.clone()))
            .stderr(OutputSink::Capture(stderr.clone())),
    );

    assert_eq!(controller.run().expect("run failed"), Some(0));
    assert_eq!(stdout.to_string_lossy(), "hello\n");
    assert_eq!(stderr.contents(), b"oops\n");
}

#[test]
fn test_discarded_output() {
    let mut controller = controller("hello", SandboxBuilder::new());
    assert_eq!(controller.run().expect("run failed"), Some(0));
}

#[test]
fn test_stdin_bytes() {
    let (exit_code, stdout) = run_captured(
        "echo",
        SandboxBuilder::new().stdin(InputSource::Bytes(b"ping".to_vec())),
    );
    assert_eq!(exit_code, 0);
    assert_eq!(stdout.contents(), b"ping");
}

#[test]
fn test_empty_stdin_reads_nothing() {
    let (_, stdout) = run_captured("echo", SandboxBuilder::new());
    assert!(stdout.contents().is_empty());
}

#[test]
fn test_seeded_random_is_reproducible() {
    let (_, first) = run_captured("random", SandboxBuilder::new().random(RandomSource::Seeded(7)));
    let (_, second) = run_captured("random", SandboxBuilder::new().random(RandomSource::Seeded(7)));
    let (_, other) = run_captured("random", SandboxBuilder::new().random(RandomSource::Seeded(8)));

    assert_eq!(first.contents().len(), 16);
    assert_eq!(first.contents(), second.contents());
    assert_ne!(first.contents(), other.contents());
}

#[test]
fn test_manual_clock_steps_per_read() {
    let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let clock = ManualClock::new(start, Duration::from_millis(10));
    let (_, stdout) = run_captured(
        "clock",
        SandboxBuilder::new().clock(ClockSource::Manual(clock.clone())),
    );

    let bytes = stdout.contents();
    assert_eq!(bytes.len(), 16);
    let first = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let second = u64::from_le_bytes(bytes[8..16].try_into().unwrap());

    assert!(first >= 1_700_000_000 * 1_000_000_000);
    assert_eq!(second - first, 10_000_000);
    assert!(clock.reads() >= 2);
}

#[test]
fn test_equal_manual_clocks_give_identical_runs() {
    let start = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let builder = || {
        SandboxBuilder::new()
            .clock(ClockSource::Manual(ManualClock::new(start, Duration::from_micros(3))))
            .random(RandomSource::Seeded(11))
    };

    let (first_exit, first) = run_captured("clock", builder());
    let (second_exit, second) = run_captured("clock", builder());
    assert_eq!(first_exit, second_exit);
    assert_eq!(first.contents().len(), 16);
    assert_eq!(first.contents(), second.contents());

    let (_, first) = run_captured("random", builder());
    let (_, second) = run_captured("random", builder());
    assert_eq!(first.contents(), second.contents());
}

#[test]
fn test_realtime_clock_is_current() {
    let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    let (_, stdout) = run_captured("clock", SandboxBuilder::new());
    let bytes = stdout.contents();
    let first = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    assert!(u128::from(first) + 1_000_000_000 >= before.as_nanos());
}

#[test]
fn test_argv_and_environment_counts() {
    let run_file = SandboxBuilder::new().program("print(1)").env("extra", "1").build();
    let expected = run_file.argv().len() * 16 + run_file.env().len();
    assert_eq!(run_file.argv().len(), 2);

    let (engine, artifact) = compile_guest("args_env");
    let mut controller =
        coilbox::ExecutionController::new(run_file.instantiate(&engine, &artifact).unwrap());
    assert_eq!(controller.run().unwrap(), Some(expected as i32));

    let interactive = SandboxBuilder::new().build();
    assert_eq!(interactive.argv(), vec!["python".to_string()]);
    let expected = 16 + interactive.env().len();
    let mut controller =
        coilbox::ExecutionController::new(interactive.instantiate(&engine, &artifact).unwrap());
    assert_eq!(controller.run().unwrap(), Some(expected as i32));
}

#[test]
fn test_program_readable_at_main_path() {
    let (exit_code, stdout) = run_captured(
        "cat_main",
        SandboxBuilder::new().program("print('from main')\n"),
    );
    assert_eq!(exit_code, 0);
    assert_eq!(stdout.to_string_lossy(), "print('from main')\n");
}

#[test]
fn test_program_cannot_be_overwritten_or_removed() {
    let mut controller = controller("write_main", SandboxBuilder::new().program("print('safe')\n"));
    assert_eq!(controller.run().expect("run failed"), Some(0));
    assert_eq!(
        controller.session().root().read_file("main.py").unwrap(),
        b"print('safe')\n"
    );
}

#[test]
fn test_read_only_entry_cannot_be_overwritten() {
    let mut controller = controller(
        "write_main",
        SandboxBuilder::new().fs_entry(FsEntry::read_only_file("/main.py", "data")),
    );
    assert_eq!(controller.run().expect("run failed"), Some(0));
    assert_eq!(controller.session().root().read_file("main.py").unwrap(), b"data");
}

#[test]
fn test_writable_file_can_be_overwritten() {
    let mut controller = controller("write_main", SandboxBuilder::new().file("/main.py", "data"));
    assert_eq!(controller.run().expect("run failed"), Some(3));
    assert!(controller.session().root().read_file("main.py").is_err());
}

#[test]
fn test_scratch_dir_writable_beside_read_only_program() {
    // With the root locked, fd 4 is the writable /tmp preopen
    let mut controller = controller("create_in_data", SandboxBuilder::new().program("print(1)"));
    assert_eq!(controller.run().expect("run failed"), Some(0));
    assert!(controller.session().root().path().join("tmp/new.txt").exists());
}

#[test]
fn test_program_missing_in_interactive_mode() {
    let (exit_code, stdout) = run_captured("cat_main", SandboxBuilder::new());
    assert_eq!(exit_code, 1);
    assert!(stdout.contents().is_empty());
}

#[test]
fn test_read_only_mount() {
    let host = tempfile::tempdir().unwrap();
    fs::write(host.path().join("hello.txt"), "mounted\n").unwrap();
    let mount = MountConfig::read_only(host.path().to_string_lossy(), "/data");

    let (exit_code, stdout) = run_captured("cat_data", SandboxBuilder::new().mount(mount.clone()));
    assert_eq!(exit_code, 0);
    assert_eq!(stdout.to_string_lossy(), "mounted\n");

    let (errno, _) = run_captured("create_in_data", SandboxBuilder::new().mount(mount));
    assert_ne!(errno, 0);
    assert!(!host.path().join("new.txt").exists());
}

#[test]
fn test_missing_required_mount_rejected() {
    let (engine, artifact) = compile_guest("hello");
    let result = SandboxBuilder::new()
        .mount(MountConfig::read_only("/nonexistent/coilbox-data", "/data"))
        .build()
        .instantiate(&engine, &artifact);
    assert!(matches!(result, Err(SandboxError::MountSourceNotFound(_))));
}

#[test]
fn test_missing_entry_point_rejected() {
    let (engine, artifact) = compile_guest("no_start");
    let result = SandboxBuilder::new().build().instantiate(&engine, &artifact);
    assert!(matches!(result, Err(SandboxError::MissingExport("_start"))));
}

#[test]
fn test_scratch_files_visible_to_host() {
    let (engine, artifact) = compile_guest("hello");
    let session = SandboxBuilder::new()
        .file("/data/input.txt", "abc")
        .dir("/tmp")
        .build()
        .instantiate(&engine, &artifact)
        .unwrap();

    assert_eq!(session.root().read_file("/data/input.txt").unwrap(), b"abc");
    assert!(session.root().path().join("tmp").is_dir());
}

#[test]
fn test_linker_extension_reads_guest_memory() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let builder = SandboxBuilder::new().linker(move |linker| {
        let sink = Arc::clone(&sink);
        linker.func_wrap(
            "host",
            "emit",
            move |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
                let memory = caller
                    .get_export("memory")
                    .and_then(|export| export.into_memory())
                    .ok_or_else(|| wasmtime::Error::msg("guest has no memory"))?;
                let mut bytes = vec![0u8; len as usize];
                memory.read(&mut caller, ptr as usize, &mut bytes)?;
                sink.lock().unwrap().extend_from_slice(&bytes);
                Ok(len)
            },
        )?;
        Ok(())
    });

    let mut controller = controller("host_call", builder);
    assert_eq!(controller.run().expect("run failed"), Some(10));
    assert_eq!(seen.lock().unwrap().as_slice(), b"from guest");
}

#[test]
fn test_missing_host_import_fails_to_instantiate() {
    let (engine, artifact) = compile_guest("host_call");
    let result = SandboxBuilder::new().build().instantiate(&engine, &artifact);
    assert!(matches!(result, Err(SandboxError::Instantiate(_))));
}
