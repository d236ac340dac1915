//! Integration tests for the Foreman CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the foreman binary
fn foreman() -> Command {
    Command::new(cargo::cargo_bin!("foreman"))
}

fn project_with_tasks(json: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".foreman")).unwrap();
    std::fs::write(temp.path().join(".foreman/tasks.json"), json).unwrap();
    temp
}

const BACKLOG: &str = r#"{
    "tasks": [
        { "id": "low", "title": "Polish docs", "priority": "low" },
        { "id": "high", "title": "Fix login bug", "priority": "high" },
        { "id": "after", "title": "Ship release", "status": "blocked", "blockedBy": ["high"] },
        { "id": "gone", "title": "Already shipped", "status": "done" }
    ]
}"#;

#[test]
fn test_help() {
    foreman()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Supervise a coding agent"));
}

#[test]
fn test_version() {
    foreman()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_tasks_list_shows_readiness() {
    let temp = project_with_tasks(BACKLOG);

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fix login bug"))
        .stdout(predicate::str::contains("blocked"))
        .stdout(predicate::str::contains("ready"));
}

#[test]
fn test_tasks_list_json() {
    let temp = project_with_tasks(BACKLOG);

    let output = foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2]["readiness"]["kind"], "not_todo");
}

#[test]
fn test_tasks_next_picks_high_priority() {
    let temp = project_with_tasks(BACKLOG);

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "next"])
        .assert()
        .success()
        .stdout(predicate::str::contains("high"))
        .stdout(predicate::str::contains("Fix login bug"));
}

#[test]
fn test_tasks_next_with_nothing_ready() {
    let temp = project_with_tasks(
        r#"{"tasks": [{ "id": "a", "title": "Waits", "blockedBy": ["missing"] }]}"#,
    );

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "next"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No executable tasks"));
}

#[test]
fn test_tasks_sweep_unblocks() {
    let temp = project_with_tasks(
        r#"{"tasks": [
            { "id": "a", "title": "First", "status": "done" },
            { "id": "b", "title": "Second", "status": "blocked", "blockedBy": ["a"] }
        ]}"#,
    );

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-> todo"));

    let saved = std::fs::read_to_string(temp.path().join(".foreman/tasks.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(value["tasks"][1]["status"], "todo");
}

#[test]
fn test_tasks_with_missing_file() {
    let temp = TempDir::new().unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["tasks", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks"));
}

#[test]
fn test_classify_git_push_requires_approval() {
    foreman()
        .args(["classify", "Committed and ran git push origin main"])
        .assert()
        .success()
        .stdout(predicate::str::contains("requires approval"));
}

#[test]
fn test_classify_test_run_json() {
    foreman()
        .args(["classify", "--json", "Ran cargo test, all green"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""kind": "test_run""#))
        .stdout(predicate::str::contains(r#""requiresApproval": false"#));
}

#[test]
fn test_classify_uses_configured_rules() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".foreman")).unwrap();
    std::fs::write(
        temp.path().join(".foreman/config.json"),
        r#"{"classifierRules": [{"name": "deploy", "kind": "git_push", "patterns": ["\\bdeployed\\b"]}]}"#,
    )
    .unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["classify", "--json", "Ran cargo test and deployed to staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""rule": "deploy""#))
        .stdout(predicate::str::contains(r#""requiresApproval": true"#));
}

#[test]
fn test_config_show_defaults() {
    let temp = TempDir::new().unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("maxTokensPerHour"))
        .stdout(predicate::str::contains("tickIntervalSecs"));
}

#[test]
fn test_config_validate_rejects_bad_thresholds() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".foreman")).unwrap();
    std::fs::write(
        temp.path().join(".foreman/config.json"),
        r#"{"usageLimits": {"warningThreshold": 0.9, "pauseThreshold": 0.5}}"#,
    )
    .unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("warningThreshold"));
}

#[test]
fn test_config_validate_ok() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".foreman")).unwrap();
    std::fs::write(temp.path().join(".foreman/config.json"), r#"{"tickIntervalSecs": 3}"#)
        .unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_config_paths() {
    let temp = TempDir::new().unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "paths"])
        .assert()
        .success()
        .stdout(predicate::str::contains("state.json"));
}

#[test]
fn test_run_without_agent_fails() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".foreman")).unwrap();
    std::fs::write(
        temp.path().join(".foreman/config.json"),
        r#"{"agent": {"command": "foreman-no-such-agent"}}"#,
    )
    .unwrap();

    foreman()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("foreman-no-such-agent"))
        .stderr(predicate::str::contains("run foreman again"));
}

#[test]
fn test_missing_project_dir() {
    foreman()
        .args(["--project", "/nonexistent/foreman/project", "tasks", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
