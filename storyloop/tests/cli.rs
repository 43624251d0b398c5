//! Binary-level tests: spawn `storyloop` with a shell-script agent and check
//! exit codes and on-disk effects.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use storyloop::exit_codes;
use storyloop::io::config::{Config, DEFAULT_CONFIG_PATH, write_config};

const PLAN: &str = r#"{
  "project_name": "demo",
  "stories": [
    {"id": "p1", "title": "First", "description": "first", "acceptance_criteria": ["ok"], "priority": 1},
    {"id": "p2", "title": "Second", "description": "second", "acceptance_criteria": ["ok"], "priority": 2}
  ]
}"#;

/// Agent that answers generation prompts with `plan.json` and runs `on_story`
/// (a shell `case` body matched against the prompt) for implementation prompts.
fn write_project(root: &Path, on_story: &str, max_retries: u32) {
    fs::write(root.join("plan.json"), PLAN).expect("write plan");
    let script = format!(
        r#"prompt=$(cat); case "$prompt" in {on_story} *) cat plan.json ;; esac"#
    );
    let config = Config {
        agent: "command".to_string(),
        command: vec!["sh".to_string(), "-c".to_string(), script],
        lock_poll_ms: 5,
        max_retries,
        ..Config::default()
    };
    write_config(&root.join(DEFAULT_CONFIG_PATH), &config).expect("write config");
}

fn storyloop(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_storyloop"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("run storyloop")
}

#[test]
fn resume_without_a_task_set_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(temp.path(), "", 3);
    let output = storyloop(temp.path(), &["--resume"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

#[test]
fn missing_request_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(temp.path(), "", 3);
    let output = storyloop(temp.path(), &[]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
}

#[test]
fn dry_run_prints_plan_without_persisting() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(temp.path(), "", 3);
    let output = storyloop(temp.path(), &["build a demo", "--dry-run"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"project_name\": \"demo\""));
    assert!(!temp.path().join("prd.json").exists());
}

#[test]
fn full_run_completes_and_removes_the_task_set() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(
        temp.path(),
        r#"*"Current story"*) echo "COMPLETED: done" ;;"#,
        3,
    );
    let output = storyloop(temp.path(), &["build a demo"]);

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!temp.path().join("prd.json").exists());
    assert!(String::from_utf8_lossy(&output.stdout).contains("All 2 stories passed"));
}

#[test]
fn partial_progress_exits_with_partial_code_and_keeps_the_task_set() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(
        temp.path(),
        r#"*"Current story: p1"*) echo "COMPLETED: p1" ;; *"Current story"*) echo "still failing" ;;"#,
        1,
    );
    let output = storyloop(temp.path(), &["build a demo"]);

    assert_eq!(output.status.code(), Some(exit_codes::PARTIAL));
    let raw = fs::read_to_string(temp.path().join("prd.json")).expect("task set kept");
    assert!(raw.contains("\"retry_count\": 1"));

    // A second run without --resume refuses to clobber it.
    let again = storyloop(temp.path(), &["build a demo"]);
    assert_eq!(again.status.code(), Some(exit_codes::FAILED));
}
