//! Tests for config file resolution and loading
//!
//! Uses serial_test because resolution reads the MIXDECK_CONFIG environment
//! variable.

use mixdeck_common::config::{resolve_config_path, AudioConfig, CONFIG_ENV_VAR};
use mixdeck_common::Error;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::Path;

fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("audio.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
#[serial]
fn test_explicit_path_wins_over_env() {
    let dir = tempfile::tempdir().unwrap();
    let explicit = write_config(dir.path(), "[session]\nvolume = 0.3");
    env::set_var(CONFIG_ENV_VAR, "/nonexistent/other.toml");

    let resolved = resolve_config_path(Some(&explicit));
    assert_eq!(resolved.as_deref(), Some(explicit.as_path()));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_var_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[session]\nmax_channels = 4");
    env::set_var(CONFIG_ENV_VAR, &path);

    let config = AudioConfig::load_or_default(None).unwrap();
    assert_eq!(config.session.max_channels, 4);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
fn test_load_reports_parse_errors_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[session\nvolume = ");

    match AudioConfig::load(&path) {
        Err(Error::Toml { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("Expected TOML error, got {:?}", other),
    }
}

#[test]
fn test_load_missing_file_is_io_error() {
    let result = AudioConfig::load(Path::new("/nonexistent/mixdeck/audio.toml"));
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn test_load_layout_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [[channels]]
        name = "music"
        limit = 2
        children = [{ name = "stingers", volume = 0.4 }]
        "#,
    );

    let config = AudioConfig::load(&path).unwrap();
    assert_eq!(config.channels[0].name, "music");
    assert_eq!(config.channels[0].children[0].options().volume, 0.4);
    assert_eq!(config.layout_channel_count(), 2);
}
