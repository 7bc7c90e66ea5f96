//! Smoke tests running the `kiln` binary against small projects in temp
//! directories.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn kiln() -> Command {
    Command::cargo_bin("kiln").unwrap()
}

fn write_copy_project(dir: &Path) {
    fs::write(dir.join("in.txt"), "cli hello").unwrap();
    fs::write(
        dir.join("build.kiln"),
        "client:\n  name: kiln\ntargets:\n  all: [out.txt]\ncommands:\n  copy:\n    tool: shell\n    inputs: [in.txt]\n    outputs: [out.txt]\n    args: cp in.txt out.txt && echo ran >> runs.log\n",
    )
    .unwrap();
}

fn run_count(dir: &Path) -> usize {
    fs::read_to_string(dir.join("runs.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[test]
fn help_lists_the_core_options() {
    kiln()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--chdir"))
        .stdout(predicate::str::contains("--no-db"))
        .stdout(predicate::str::contains("--serial"))
        .stdout(predicate::str::contains("--trace"));
}

#[test]
fn builds_and_then_null_rebuilds() {
    let temp = TempDir::new().unwrap();
    write_copy_project(temp.path());

    kiln()
        .current_dir(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Build complete"));
    assert_eq!(
        fs::read_to_string(temp.path().join("out.txt")).unwrap(),
        "cli hello"
    );
    assert_eq!(run_count(temp.path()), 1);
    assert!(temp.path().join("build.db").exists());

    // The database makes the second invocation a null build.
    kiln().current_dir(temp.path()).assert().success();
    assert_eq!(run_count(temp.path()), 1);
}

#[test]
fn explicit_target_and_serial_mode() {
    let temp = TempDir::new().unwrap();
    write_copy_project(temp.path());

    kiln()
        .current_dir(temp.path())
        .args(["--serial", "all"])
        .assert()
        .success();
    assert_eq!(run_count(temp.path()), 1);
}

#[test]
fn no_db_forgets_results_between_runs() {
    let temp = TempDir::new().unwrap();
    write_copy_project(temp.path());

    kiln().current_dir(temp.path()).arg("--no-db").assert().success();
    kiln().current_dir(temp.path()).arg("--no-db").assert().success();
    assert!(!temp.path().join("build.db").exists());
    assert_eq!(run_count(temp.path()), 2);
}

#[test]
fn chdir_runs_the_build_elsewhere() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("project");
    fs::create_dir(&project).unwrap();
    write_copy_project(&project);

    kiln()
        .current_dir(temp.path())
        .args(["-C", "project"])
        .assert()
        .success();
    assert!(project.join("out.txt").exists());
}

#[test]
fn trace_writes_decision_records() {
    let temp = TempDir::new().unwrap();
    write_copy_project(temp.path());

    kiln()
        .current_dir(temp.path())
        .args(["--trace", "trace.jsonl"])
        .assert()
        .success();

    let trace = fs::read_to_string(temp.path().join("trace.jsonl")).unwrap();
    assert!(trace.lines().count() >= 2);
    assert!(trace.contains("build-started"));
}

#[test]
fn failing_command_exits_nonzero() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("build.kiln"),
        "client:\n  name: kiln\ntargets:\n  all: [out.txt]\ncommands:\n  fail:\n    tool: shell\n    outputs: [out.txt]\n    args: exit 1\n",
    )
    .unwrap();

    kiln()
        .current_dir(temp.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed command"));
}

#[test]
fn bad_description_exits_nonzero_with_location() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("build.kiln"),
        "client:\n  name: kiln\nbogus-section:\n  x: 1\n",
    )
    .unwrap();

    kiln()
        .current_dir(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected trailing top-level section"));
}

#[test]
fn missing_description_exits_nonzero() {
    let temp = TempDir::new().unwrap();
    kiln()
        .current_dir(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unable to read build description"));
}
