//! Configuration loading and precedence tests

use pkgdb_config::{ConfigError, ConfigLoader, ProviderSettings};
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    "PKGDB_CACHEDIR",
    "PKGDB_SYSTEM",
    "PKGDB_FIXTURES",
    "PKGDB_PROVIDER_COMMAND",
    "_PKGDB_GA_REGISTRY_REF_OR_REV",
];

fn clear_env() {
    for var in ENV_VARS {
        env::remove_var(var);
    }
}

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("config.toml");
    fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// File Loading
// ============================================================================

#[test]
#[serial]
fn test_load_explicit_config_file() {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(
        temp.path(),
        r#"
[cache]
dir = "/srv/pkgdb"

[provider]
fixtures = "/srv/fixtures.json"

[defaults]
system = "x86_64-linux"
"#,
    );

    let settings = ConfigLoader::new().with_config_file(&path).load().unwrap();

    assert_eq!(settings.cache_dir, PathBuf::from("/srv/pkgdb"));
    assert_eq!(settings.system, "x86_64-linux");
    assert_eq!(
        settings.provider,
        ProviderSettings::Fixtures(PathBuf::from("/srv/fixtures.json"))
    );
}

#[test]
#[serial]
fn test_invalid_toml_reports_file() {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(temp.path(), "[cache\ndir = 1");

    let err = ConfigLoader::new()
        .with_config_file(&path)
        .load()
        .unwrap_err();

    match err {
        ConfigError::TomlParseError { file, .. } => assert_eq!(file, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case("[db-lock]\ntouch-interval-ms = 500\nmax-update-age-ms = 100\n")]
#[case("[db-lock]\nmax-attempts = 0\n")]
#[serial]
fn test_invalid_lock_timings(#[case] content: &str) {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(
        temp.path(),
        &format!("[cache]\ndir = \"/tmp/pkgdb\"\n{content}"),
    );

    let result = ConfigLoader::new().with_config_file(&path).load();
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

// ============================================================================
// Environment Overrides
// ============================================================================

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(
        temp.path(),
        r#"
[cache]
dir = "/srv/pkgdb"

[defaults]
system = "x86_64-linux"
"#,
    );

    env::set_var("PKGDB_CACHEDIR", temp.path().join("cache"));
    env::set_var("PKGDB_SYSTEM", "aarch64-darwin");
    env::set_var("PKGDB_PROVIDER_COMMAND", "pkgdb-eval");
    env::set_var("_PKGDB_GA_REGISTRY_REF_OR_REV", "release-24.05");

    let settings = ConfigLoader::new().with_config_file(&path).load().unwrap();
    clear_env();

    assert_eq!(settings.cache_dir, temp.path().join("cache"));
    assert_eq!(settings.system, "aarch64-darwin");
    assert_eq!(settings.ga_registry_ref, "release-24.05");
    assert_eq!(
        settings.provider,
        ProviderSettings::Command {
            program: "pkgdb-eval".to_string(),
            args: Vec::new(),
        }
    );
}

#[test]
#[serial]
fn test_fixtures_env_wins_over_command_env() {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(temp.path(), "[cache]\ndir = \"/tmp/pkgdb\"\n");

    env::set_var("PKGDB_FIXTURES", "/tmp/fixtures.json");
    env::set_var("PKGDB_PROVIDER_COMMAND", "pkgdb-eval");

    let settings = ConfigLoader::new().with_config_file(&path).load().unwrap();
    clear_env();

    assert_eq!(
        settings.provider,
        ProviderSettings::Fixtures(PathBuf::from("/tmp/fixtures.json"))
    );
}

#[test]
#[serial]
fn test_invalid_system_env_rejected() {
    clear_env();
    let temp = TempDir::new().unwrap();
    let path = write_config(temp.path(), "[cache]\ndir = \"/tmp/pkgdb\"\n");

    env::set_var("PKGDB_SYSTEM", "linux");
    let result = ConfigLoader::new().with_config_file(&path).load();
    clear_env();

    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}
