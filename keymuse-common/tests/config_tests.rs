//! Configuration resolution and graceful degradation tests
//!
//! Missing or malformed config files must never abort startup; the
//! resolver warns and falls back to compiled defaults.
//!
//! Note: tests that manipulate KEYMUSE_CONFIG are marked #[serial] to
//! prevent environment-variable races between parallel tests.

use keymuse_common::config::{Config, CONFIG_ENV_VAR};
use serial_test::serial;
use std::env;
use std::io::Write;

#[test]
#[serial]
fn cli_path_takes_priority_over_env() {
    let mut cli_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(cli_file, "[qos]\nrate_limit_per_sec = 7").unwrap();

    let mut env_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(env_file, "[qos]\nrate_limit_per_sec = 99").unwrap();

    env::set_var(CONFIG_ENV_VAR, env_file.path());
    let config = Config::resolve(Some(cli_file.path()));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.qos.rate_limit_per_sec, 7);
}

#[test]
#[serial]
fn env_path_is_used_when_no_cli_path() {
    let mut env_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(env_file, "[qos]\nbatch_size = 5").unwrap();

    env::set_var(CONFIG_ENV_VAR, env_file.path());
    let config = Config::resolve(None);
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.qos.batch_size, 5);
}

#[test]
#[serial]
fn missing_file_degrades_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let config = Config::resolve(Some(std::path::Path::new(
        "/nonexistent/keymuse-test/config.toml",
    )));
    assert_eq!(config, Config::default());
}

#[test]
#[serial]
fn malformed_toml_degrades_to_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "this is not toml {{").unwrap();

    env::remove_var(CONFIG_ENV_VAR);
    let config = Config::resolve(Some(file.path()));
    assert_eq!(config, Config::default());
}

#[test]
fn load_from_reads_nested_sections() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[qos]
rate_limit_per_sec = 42
idle_timeout_secs = 60

[analysis]
pause_threshold_ms = 400.0
"#
    )
    .unwrap();

    let config = Config::load_from(file.path()).unwrap();
    assert_eq!(config.qos.rate_limit_per_sec, 42);
    assert_eq!(config.qos.idle_timeout_secs, 60);
    assert_eq!(config.analysis.pause_threshold_ms, 400.0);
    // Untouched fields keep their defaults
    assert_eq!(config.qos.batch_interval_ms, 100);
}
