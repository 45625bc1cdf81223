use std::path::PathBuf;

use coilbox::config::{Config, ConfigError};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{}/configs/valid_full.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(
        config.module_path,
        Some(PathBuf::from("/opt/coilbox/python.wasm"))
    );
    assert_eq!(config.program_name, "python3.12");
    assert_eq!(config.default_limits.fuel, Some(2_000_000_000));
    assert_eq!(config.env.get("lang").map(String::as_str), Some("C.UTF-8"));

    let mounts = config.all_mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].target, "/lib");
    assert!(!mounts[0].writable);
    assert_eq!(mounts[1].target, "/data");
    assert!(mounts[1].optional);
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{}/configs/valid_minimal.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.require_module().unwrap(), PathBuf::from("python.wasm"));
    assert_eq!(config.program_name, "python");
    assert!(config.stdlib_mount().is_none());
}

#[test]
fn test_load_invalid_relative_mount() {
    let path = format!("{}/configs/invalid_relative_mount.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_empty_program_name() {
    let path = format!("{}/configs/invalid_empty_program_name.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(result.is_err());
}

#[test]
fn test_optional_mount_missing_is_skipped() {
    let path = format!("{}/configs/valid_full.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).unwrap();
    let sandbox = coilbox::SandboxBuilder::new()
        .mounts(config.sandbox_mounts.clone())
        .build();
    let mounts = coilbox::sandbox::validate_mounts(sandbox.mounts()).unwrap();
    assert!(mounts.is_empty() || std::path::Path::new("/srv/datasets").exists());
}
