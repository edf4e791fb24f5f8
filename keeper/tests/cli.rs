//! CLI tests: spawn the `keeper` binary and check exit codes.

use std::path::Path;
use std::process::{Command, Output};

use keeper::core::types::MilestoneStatus;
use keeper::exit_codes;
use keeper::io::backlog::write_backlog;
use keeper::io::config::{KeeperConfig, TruthCheck, write_config};
use keeper::io::init::{InitOptions, KeeperPaths, init_keeper};
use keeper::test_support::{milestone, milestone_with_status};

fn keeper(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_keeper"))
        .current_dir(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn keeper")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn initialized() -> (tempfile::TempDir, KeeperPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_keeper(temp.path(), &InitOptions { force: false }).expect("init");
    (temp, paths)
}

#[test]
fn init_then_validate_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = keeper(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK), "{}", stderr(&init));
    assert!(temp.path().join(".keeper/config.toml").is_file());

    let validate = keeper(temp.path(), &["validate"]);
    assert_eq!(validate.status.code(), Some(exit_codes::OK), "{}", stderr(&validate));
    assert_eq!(stdout(&validate).trim(), "ok: 0 milestones, 0 truth checks");

    let again = keeper(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&again).contains("already exists"));
}

#[test]
fn validate_without_layout_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = keeper(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("keeper init"));
}

#[test]
fn select_prints_next_todo() {
    let (temp, paths) = initialized();
    write_backlog(
        &paths.backlog_path,
        &[
            milestone_with_status("shipped", MilestoneStatus::Done),
            milestone("next-up"),
            milestone("after"),
        ],
    )
    .expect("write backlog");

    let output = keeper(temp.path(), &["select"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&output).trim(), "next-up");
}

#[test]
fn select_reports_empty_and_busy_backlogs() {
    let (temp, paths) = initialized();
    let empty = keeper(temp.path(), &["select"]);
    assert_eq!(empty.status.code(), Some(exit_codes::EMPTY));

    write_backlog(
        &paths.backlog_path,
        &[
            milestone("waiting"),
            milestone_with_status("active", MilestoneStatus::InProgress),
        ],
    )
    .expect("write backlog");
    let busy = keeper(temp.path(), &["select"]);
    assert_eq!(busy.status.code(), Some(exit_codes::BUSY));
    assert!(stderr(&busy).contains("'active'"));
}

#[test]
fn check_exit_code_follows_truth_checks() {
    let (temp, paths) = initialized();
    let mut cfg = KeeperConfig {
        truth_checks: vec![TruthCheck {
            name: "smoke".to_string(),
            command: "echo ok".to_string(),
        }],
        ..KeeperConfig::default()
    };
    write_config(&paths.config_path, &cfg).expect("write config");

    let green = keeper(temp.path(), &["check"]);
    assert_eq!(green.status.code(), Some(exit_codes::OK));
    assert!(stdout(&green).contains("- `echo ok`: PASS (exit 0)"));
    assert!(paths.default_verification_path.is_file());

    cfg.truth_checks.push(TruthCheck {
        name: "broken".to_string(),
        command: "exit 3".to_string(),
    });
    write_config(&paths.config_path, &cfg).expect("write config");
    let red = keeper(temp.path(), &["check"]);
    assert_eq!(red.status.code(), Some(exit_codes::RED));
    assert!(stdout(&red).contains("- `exit 3`: FAIL (exit 3)"));
}

#[test]
fn summary_renders_for_a_given_day() {
    let (temp, _paths) = initialized();
    let output = keeper(temp.path(), &["summary", "--date", "2026-10-19"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    let markdown = stdout(&output);
    assert!(markdown.starts_with("## Keeper Daily Summary (2026-10-19)"));
    assert!(markdown.contains("- total: 0"));
}

#[test]
fn run_without_repository_is_invalid() {
    let (temp, _paths) = initialized();
    let output = keeper(temp.path(), &["run", "--mode", "milestone"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("repository"));
}
