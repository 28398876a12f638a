//! The `typelens` binary end to end.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

use crate::common::{self, MOCK_SERVER, SOURCE, TYPELENS};

fn write_config(dir: &Path, extra_args: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
[analysis]
enabled = true
command = "{}"
args = [{extra_args}]
language_id = "python"
handshake_timeout_secs = 5
shutdown_timeout_secs = 2

[cache]
enabled = true
"#,
        MOCK_SERVER.replace('\\', "\\\\")
    );
    common::write_file(dir, "config.toml", &config)
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(TYPELENS)
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run typelens")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn hover_prints_result() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let source = common::write_file(dir.path(), "main.py", SOURCE);

    let output = run(&config, &["hover", source.to_str().unwrap(), "1", "0"]);
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["result"]["contents"], "total at 1:0");
    assert!(json.get("error").is_none());
}

#[test]
fn definition_prints_locations() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let source = common::write_file(dir.path(), "main.py", SOURCE);

    let output = run(&config, &["definition", source.to_str().unwrap(), "1", "9"]);
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["result"][0]["range"]["start"]["line"], 0);
}

#[test]
fn unavailable_server_degrades_with_exit_zero() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), r#""--fail-initialize""#);
    let source = common::write_file(dir.path(), "main.py", SOURCE);

    let output = run(&config, &["hover", source.to_str().unwrap(), "0", "0"]);
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert!(json["result"].is_null());
    assert_eq!(json["error"]["kind"], "not_running");
    assert_eq!(json["error"]["degraded"], true);
}

#[test]
fn health_reports_breakers() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "");

    let output = run(&config, &["health"]);
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["state"], "READY");
    assert_eq!(json["breakers"][0]["name"], "analysis");
    assert_eq!(json["breakers"][0]["config"]["failure_threshold"], 3);
    assert_eq!(json["breakers"][1]["name"], "cache");
}

#[test]
fn invalid_config_exits_one() {
    let dir = tempdir().unwrap();
    let config = common::write_file(
        dir.path(),
        "config.toml",
        "[analysis]\nenabled = true\ncommand = \"\"\n",
    );

    let output = run(&config, &["health"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn usage_error_exits_one() {
    let output = Command::new(TYPELENS)
        .args(["hover", "main.py", "not-a-line", "0"])
        .output()
        .expect("run typelens");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());

    let help = Command::new(TYPELENS)
        .arg("--help")
        .output()
        .expect("run typelens");
    assert!(help.status.success());
}

#[test]
fn missing_source_file_exits_one() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let missing = dir.path().join("missing.py");

    let output = run(&config, &["hover", missing.to_str().unwrap(), "0", "0"]);
    assert_eq!(output.status.code(), Some(1));
}
