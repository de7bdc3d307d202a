//! Config file resolution priority

use std::io::Write;
use std::path::Path;
use streamsync_common::config::{load_or_default, resolve_config_path};

#[derive(Debug, Default, serde::Deserialize, PartialEq)]
struct Doc {
    #[serde(default)]
    name: String,
}

#[test]
fn test_env_var_used_when_no_cli_arg() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "name = \"from-env\"").unwrap();

    let var = "STREAMSYNC_CONFIG_TEST_ENV_ONLY";
    std::env::set_var(var, file.path());
    let resolved = resolve_config_path(None, var).unwrap();
    std::env::remove_var(var);

    assert_eq!(resolved.as_deref(), Some(file.path()));
}

#[test]
fn test_cli_arg_beats_env_var() {
    let mut cli = tempfile::NamedTempFile::new().unwrap();
    writeln!(cli, "name = \"from-cli\"").unwrap();
    let env = tempfile::NamedTempFile::new().unwrap();

    let var = "STREAMSYNC_CONFIG_TEST_BOTH";
    std::env::set_var(var, env.path());
    let doc: Doc = load_or_default(Some(cli.path()), var).unwrap();
    std::env::remove_var(var);

    assert_eq!(doc.name, "from-cli");
}

#[test]
fn test_missing_env_path_is_error() {
    let var = "STREAMSYNC_CONFIG_TEST_MISSING";
    std::env::set_var(var, "/nonexistent/streamsync/engine.toml");
    let result = resolve_config_path(None::<&Path>, var);
    std::env::remove_var(var);

    assert!(result.is_err());
}
