//! CLI tests for the `steward` binary.
//!
//! Spawns the binary against a temp root and checks exit codes and the JSON
//! it prints for init, turn, replay, and verify.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use steward::exit_codes;
use steward::io::config::{load_config, write_config};
use steward::io::init::{InitOptions, StewardPaths, init_root};
use steward::io::ledger::StreamId;

fn steward(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_steward"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("run steward")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn init_then_verify_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = steward(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(StewardPaths::new(temp.path()).config_path.exists());

    let verify = steward(temp.path(), &["verify"]);
    assert_eq!(verify.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&verify.stdout).starts_with("ok:"));
}

#[test]
fn second_init_without_force_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(
        steward(temp.path(), &["init"]).status.code(),
        Some(exit_codes::OK)
    );
    assert_eq!(
        steward(temp.path(), &["init"]).status.code(),
        Some(exit_codes::INVALID)
    );
    assert_eq!(
        steward(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

/// With no executor command configured, every unit fails and the turn
/// reports an error outcome, but the ledger stays intact.
#[test]
fn turn_without_executor_reports_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_root(temp.path(), &InitOptions { force: false }).expect("init");

    let turn = steward(temp.path(), &["turn", "--session", "s1", "hello"]);
    assert_eq!(turn.status.code(), Some(exit_codes::INVALID));
    let result = stdout_json(&turn);
    assert_eq!(result["outcome"], "error");

    let verify = steward(temp.path(), &["verify"]);
    assert_eq!(verify.status.code(), Some(exit_codes::OK));
}

/// Editing a sealed governance record breaks its chain: verify reports it
/// and further turns on that session refuse to run.
#[test]
fn tampered_governance_stream_fails_verify() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_root(temp.path(), &InitOptions { force: false }).expect("init");
    steward(temp.path(), &["turn", "--session", "s1", "hello"]);

    let relative = StreamId::Governance("s1".to_string())
        .relative_path()
        .expect("path");
    let file = paths.ledger_dir.join(relative);
    let contents = fs::read_to_string(&file).expect("read governance");
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let mut first: Value = serde_json::from_str(&lines[0]).expect("record");
    first["metadata"]["message_tokens"] = Value::from(999);
    lines[0] = first.to_string();
    fs::write(&file, lines.join("\n") + "\n").expect("write governance");

    let verify = steward(temp.path(), &["verify"]);
    assert_eq!(verify.status.code(), Some(exit_codes::BROKEN_CHAIN));
    assert!(String::from_utf8_lossy(&verify.stdout).contains("governance"));

    let replay = steward(temp.path(), &["replay", "--session", "s1"]);
    assert_ne!(replay.status.code(), Some(exit_codes::OK));
}

#[cfg(unix)]
#[test]
fn turn_with_command_executor_succeeds_and_replays() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_root(temp.path(), &InitOptions { force: false }).expect("init");
    let mut config = load_config(&paths.config_path).expect("config");
    config.executor.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"cat >/dev/null; printf '%s' '{"result":"Hello from the executor","outcome":"success"}'"#
            .to_string(),
    ];
    write_config(&paths.config_path, &config).expect("write config");

    let turn = steward(temp.path(), &["turn", "--session", "s1", "hello"]);
    assert_eq!(turn.status.code(), Some(exit_codes::OK));
    let result = stdout_json(&turn);
    assert_eq!(result["outcome"], "success");
    assert_eq!(result["response"], "Hello from the executor");

    let replay = steward(temp.path(), &["replay", "--session", "s1"]);
    assert_eq!(replay.status.code(), Some(exit_codes::OK));
    let audit = stdout_json(&replay);
    assert_eq!(audit["session_id"], "s1");
    assert_eq!(audit["snapshots_checked"], 1);
    assert_eq!(
        audit["liveness"]["active_intents"].as_array().map(Vec::len),
        Some(1)
    );
}
