//! Engine configuration files and how they seed the engines

use std::io::Write;
use std::path::Path;
use streamsync_common::EventLog;
use streamsync_engine::config::EngineConfig;
use streamsync_engine::gapless::SwitchMode;
use streamsync_engine::{EngineError, GaplessEngine, SyncEngine};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
        [sync]
        frame_duration_us = 5000
        max_input_ports = 4

        [gapless]
        early_eos_delay_ms = 40
        early_eos_client = 9

        [logging]
        level = "debug"
        "#,
    );

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.sync.frame_duration_us, Some(5_000));
    assert_eq!(config.sync.max_input_ports, 4);
    assert_eq!(config.gapless.early_eos_client, Some(9));
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.file.is_none());

    let resolved = EngineConfig::resolve(Some(file.path())).unwrap();
    assert_eq!(resolved, config);
}

#[test]
fn test_invalid_file_rejected() {
    let file = write_config("[sync]\nmax_input_ports = 0\n");
    assert!(matches!(EngineConfig::load(file.path()), Err(EngineError::Config(_))));

    let file = write_config("[gapless\n");
    assert!(EngineConfig::load(file.path()).is_err());
}

#[test]
fn test_explicit_missing_file_is_error() {
    let result = EngineConfig::resolve(Some(Path::new("/nonexistent/streamsync/engine.toml")));
    assert!(result.is_err());
}

#[test]
fn test_configured_engines_start_ready() {
    let file = write_config(
        r#"
        [sync]
        max_input_ports = 3

        [gapless]
        early_eos_delay_ms = 40
        early_eos_client = 9
        frame_duration_us = 10000
        "#,
    );
    let config = EngineConfig::load(file.path()).unwrap();

    let sync = SyncEngine::new(config.sync.clone(), Box::new(EventLog::new())).unwrap();
    assert!(sync.input(2).is_some());
    assert!(sync.input(3).is_none());

    let gapless = GaplessEngine::new(config.gapless.clone(), Box::new(EventLog::new())).unwrap();
    assert_eq!(gapless.early_eos_delay_ms(), 40);
    assert_eq!(gapless.early_eos_client(), Some(9));
    // Delay lines wait for input media formats
    assert_eq!(gapless.mode(), SwitchMode::PassThrough);
}
