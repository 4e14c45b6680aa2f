// probe-queue/tests/cli_integration.rs

//! CLI surface tests. None of these reach a store: they stop at argument
//! parsing or validation.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("probe-queue").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("admin"))
        .stdout(predicate::str::contains("health"))
        .stdout(predicate::str::contains("--redis-url"));
}

#[test]
fn test_version_flag() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_worker_help_mentions_placeholders() {
    cli()
        .args(["worker", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--probe-cmd"))
        .stdout(predicate::str::contains("{domain}"));
}

#[test]
fn test_admin_help_lists_commands() {
    cli()
        .args(["admin", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reset-queue"))
        .stdout(predicate::str::contains("clear-cache"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("pardon"));
}

#[test]
fn test_missing_subcommand_fails() {
    cli().assert().failure();
}

#[test]
fn test_worker_requires_probe_command() {
    cli()
        .arg("worker")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--probe-cmd"));
}

#[test]
fn test_worker_concurrency_out_of_range() {
    cli()
        .args(["worker", "-c", "0", "--probe-cmd", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Concurrency must be between 1 and 64"));
}

#[test]
fn test_submit_requires_user_and_domains() {
    cli().args(["submit", "example.com"]).assert().failure();
    cli().args(["submit", "--user", "1"]).assert().failure();
}

#[test]
fn test_submit_rejects_bad_timeout() {
    cli()
        .args(["submit", "--user", "1", "--timeout", "soon", "example.com"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid timeout 'soon'"));
}

#[test]
fn test_status_needs_batch_or_job() {
    cli().arg("status").assert().failure();
    cli()
        .args(["status", "--batch", "b1", "--job", "j1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_inspect_requires_numeric_user() {
    cli()
        .args(["admin", "inspect", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
