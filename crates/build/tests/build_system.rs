//! End-to-end build system tests: real shell commands over temp
//! directories, incremental rebuilds, failure propagation, and discovered
//! dependencies.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use kiln_build::doc::Span;
use kiln_build::{BuildSystem, BuildSystemConfig, BuildSystemDelegate, BuildSystemError};
use tempfile::TempDir;

struct TestDelegate {
  errors: Rc<RefCell<Vec<String>>>,
}

impl BuildSystemDelegate for TestDelegate {
  fn client_name(&self) -> &str {
    "kiln"
  }

  fn error(&mut self, _filename: &str, _span: Option<Span>, message: &str) {
    self.errors.borrow_mut().push(message.to_string());
  }
}

fn system_with(description: &str, lanes: usize) -> (BuildSystem, Rc<RefCell<Vec<String>>>) {
  let errors: Rc<RefCell<Vec<String>>> = Rc::default();
  let delegate = TestDelegate {
    errors: Rc::clone(&errors),
  };
  let mut system = BuildSystem::new(Box::new(delegate), "test.kiln", BuildSystemConfig { lanes });
  system.load(description).expect("description should load");
  (system, errors)
}

/// Number of times a `>> log`-style marker command has run.
fn run_count(log: &Path) -> usize {
  fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
}

#[test]
fn copy_build_and_null_rebuild() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let input = dir.join("in.txt");
  let out = dir.join("out.txt");
  let log = dir.join("runs.log");
  fs::write(&input, "hello kiln").unwrap();

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [\"{out}\"]\ncommands:\n  copy:\n    tool: shell\n    inputs: [\"{input}\"]\n    outputs: [\"{out}\"]\n    args: cp {input} {out} && echo ran >> {log}\n",
    out = out.display(),
    input = input.display(),
    log = log.display(),
  );
  let (mut system, errors) = system_with(&description, 2);

  let results = system.build("all").unwrap();
  assert!(results.success(), "errors: {:?}", errors.borrow());
  assert_eq!(fs::read_to_string(&out).unwrap(), "hello kiln");
  assert_eq!(run_count(&log), 1);

  // Nothing changed: the command must not run again.
  let results = system.build("all").unwrap();
  assert!(results.success());
  assert_eq!(run_count(&log), 1);

  // A changed input reruns the command.
  fs::write(&input, "changed contents").unwrap();
  let results = system.build("all").unwrap();
  assert!(results.success());
  assert_eq!(fs::read_to_string(&out).unwrap(), "changed contents");
  assert_eq!(run_count(&log), 2);
}

#[test]
fn results_persist_across_system_instances() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let input = dir.join("in.txt");
  let out = dir.join("out.txt");
  let log = dir.join("runs.log");
  let db = dir.join("build.db");
  fs::write(&input, "persisted").unwrap();

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [\"{out}\"]\ncommands:\n  copy:\n    tool: shell\n    inputs: [\"{input}\"]\n    outputs: [\"{out}\"]\n    args: cp {input} {out} && echo ran >> {log}\n",
    out = out.display(),
    input = input.display(),
    log = log.display(),
  );

  {
    let (mut system, errors) = system_with(&description, 2);
    system.attach_db(&db).unwrap();
    let results = system.build("all").unwrap();
    assert!(results.success(), "errors: {:?}", errors.borrow());
    assert_eq!(run_count(&log), 1);
  }

  // A fresh process over the same database has nothing to do.
  {
    let (mut system, _errors) = system_with(&description, 2);
    system.attach_db(&db).unwrap();
    let results = system.build("all").unwrap();
    assert!(results.success());
    assert_eq!(run_count(&log), 1);
  }

  // Deleting the output forces a rebuild.
  fs::remove_file(&out).unwrap();
  {
    let (mut system, _errors) = system_with(&description, 2);
    system.attach_db(&db).unwrap();
    let results = system.build("all").unwrap();
    assert!(results.success());
    assert!(out.exists());
    assert_eq!(run_count(&log), 2);
  }
}

#[test]
fn missing_input_skips_the_command() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let missing = dir.join("nope.txt");
  let out = dir.join("out.txt");

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [\"{out}\"]\ncommands:\n  copy:\n    tool: shell\n    inputs: [\"{missing}\"]\n    outputs: [\"{out}\"]\n    args: cp {missing} {out}\n",
    out = out.display(),
    missing = missing.display(),
  );
  let (mut system, errors) = system_with(&description, 1);

  let results = system.build("all").unwrap();
  assert!(!results.success());
  assert_eq!(results.num_failed_commands, 1);
  assert!(results.num_errors >= 1);
  assert!(!out.exists());
  let errors = errors.borrow();
  assert!(
    errors.iter().any(|e| e.contains("missing input")),
    "errors: {errors:?}"
  );
}

#[test]
fn failed_command_skips_its_dependants() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let mid = dir.join("mid.txt");
  let out = dir.join("final.txt");
  let log = dir.join("second.log");

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [\"{out}\"]\ncommands:\n  first:\n    tool: shell\n    outputs: [\"{mid}\"]\n    args: exit 1\n  second:\n    tool: shell\n    inputs: [\"{mid}\"]\n    outputs: [\"{out}\"]\n    args: cp {mid} {out} && echo ran >> {log}\n",
    out = out.display(),
    mid = mid.display(),
    log = log.display(),
  );
  let (mut system, _errors) = system_with(&description, 2);

  let results = system.build("all").unwrap();
  assert!(!results.success());
  assert_eq!(results.num_failed_commands, 1);
  assert!(!out.exists());
  assert_eq!(run_count(&log), 0);
}

#[test]
fn depfile_dependencies_trigger_rebuilds() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let input = dir.join("in.txt");
  let header = dir.join("extra.h");
  let out = dir.join("out.txt");
  let depfile = dir.join("out.d");
  let log = dir.join("runs.log");
  fs::write(&input, "source").unwrap();
  fs::write(&header, "#pragma once").unwrap();

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [\"{out}\"]\ncommands:\n  compile:\n    tool: shell\n    inputs: [\"{input}\"]\n    outputs: [\"{out}\"]\n    args: cp {input} {out} && echo {out}: {header} > {depfile} && echo ran >> {log}\n    deps: \"{depfile}\"\n",
    out = out.display(),
    input = input.display(),
    header = header.display(),
    depfile = depfile.display(),
    log = log.display(),
  );
  let (mut system, errors) = system_with(&description, 1);

  let results = system.build("all").unwrap();
  assert!(results.success(), "errors: {:?}", errors.borrow());
  assert_eq!(run_count(&log), 1);

  // The discovered header is clean; still a null build.
  let results = system.build("all").unwrap();
  assert!(results.success());
  assert_eq!(run_count(&log), 1);

  // Touching only the discovered dependency reruns the command.
  fs::write(&header, "#pragma once // v2").unwrap();
  let results = system.build("all").unwrap();
  assert!(results.success());
  assert_eq!(run_count(&log), 2);
}

#[test]
fn phony_commands_group_virtual_outputs() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let input = dir.join("in.txt");
  let out = dir.join("out.txt");
  let log = dir.join("runs.log");
  fs::write(&input, "grouped").unwrap();

  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [<all>]\ncommands:\n  copy:\n    tool: shell\n    inputs: [\"{input}\"]\n    outputs: [\"{out}\"]\n    args: cp {input} {out} && echo ran >> {log}\n  group:\n    tool: phony\n    inputs: [\"{out}\"]\n    outputs: [<all>]\n",
    out = out.display(),
    input = input.display(),
    log = log.display(),
  );
  let (mut system, errors) = system_with(&description, 2);

  let results = system.build("all").unwrap();
  assert!(results.success(), "errors: {:?}", errors.borrow());
  assert_eq!(fs::read_to_string(&out).unwrap(), "grouped");
  assert_eq!(run_count(&log), 1);

  let results = system.build("all").unwrap();
  assert!(results.success());
  assert_eq!(run_count(&log), 1);
}

#[test]
fn serial_mode_builds_independent_commands() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path();
  let outs: Vec<_> = (0..3).map(|i| dir.join(format!("out-{i}.txt"))).collect();

  let commands: String = outs
    .iter()
    .enumerate()
    .map(|(i, out)| {
      format!(
        "  make-{i}:\n    tool: shell\n    outputs: [\"{out}\"]\n    args: echo {i} > {out}\n",
        out = out.display()
      )
    })
    .collect();
  let targets: Vec<String> = outs.iter().map(|o| format!("\"{}\"", o.display())).collect();
  let description = format!(
    "client:\n  name: kiln\ntargets:\n  all: [{}]\ncommands:\n{commands}",
    targets.join(", ")
  );
  let (mut system, errors) = system_with(&description, 1);

  let results = system.build("all").unwrap();
  assert!(results.success(), "errors: {:?}", errors.borrow());
  for (i, out) in outs.iter().enumerate() {
    assert_eq!(fs::read_to_string(out).unwrap().trim(), i.to_string());
  }
}

#[test]
fn unknown_target_is_an_error() {
  let description = "client:\n  name: kiln\ntargets:\n  all: []\n";
  let (mut system, _errors) = system_with(description, 1);

  let err = system.build("elsewhere").unwrap_err();
  match err {
    BuildSystemError::UnknownKey(described) => {
      assert!(described.contains("target 'elsewhere'"), "{described}");
    }
    other => panic!("expected UnknownKey, got {other}"),
  }
}

#[test]
fn wrong_client_name_fails_the_load() {
  let errors: Rc<RefCell<Vec<String>>> = Rc::default();
  let delegate = TestDelegate {
    errors: Rc::clone(&errors),
  };
  let mut system = BuildSystem::new(
    Box::new(delegate),
    "test.kiln",
    BuildSystemConfig { lanes: 1 },
  );

  let err = system.load("client:\n  name: other-tool\n").unwrap_err();
  assert_eq!(err.num_errors, 1);
  assert!(errors.borrow()[0].contains("unable to configure client"));
}
