use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "DATABASE_PATH={}\nHTTP_PORT=0\nRELAYS=ws://127.0.0.1:9\n",
        dir.path().join("deepclaw.db").display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

#[test]
fn init_cli_creates_database() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    Command::cargo_bin("deepclaw")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();

    assert!(dir.path().join("deepclaw.db").exists());
}

#[test]
fn init_cli_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    for _ in 0..2 {
        Command::cargo_bin("deepclaw")
            .unwrap()
            .args(["--env", &env_path, "init"])
            .assert()
            .success();
    }
}

#[test]
fn missing_env_file_fails() {
    Command::cargo_bin("deepclaw")
        .unwrap()
        .args(["--env", "/nonexistent/env", "init"])
        .assert()
        .failure();
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("deepclaw")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init", "serve"] {
        assert!(text.contains(cmd));
    }
}
