//! CLI tests: spawn the conductor binary and check output and exit codes.

use std::fs;
use std::process::{Command, Output, Stdio};

use conductor::exit_codes;
use conductor::test_support::TestRepo;

fn conductor(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
        .arg("-C")
        .arg(dir)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .expect("spawn conductor")
}

#[test]
fn validate_prints_schedule() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("tasks.md"),
        "\
- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->
- [ ] HTTP handler <!-- category: independent, group: impl, files: b.go -->
- [x] Docs <!-- category: independent, group: docs, files: README.md -->
",
    )
    .expect("write tasks");

    let out = conductor(temp.path(), &["validate", "--tasks", "tasks.md"]);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("phase 1 (sequential): 1 task(s)"));
    assert!(stdout.contains("1. Parser core [a.go]"));
    assert!(stdout.contains("(impl) HTTP handler [b.go]"));
    assert!(stdout.contains("already done: Docs"));
}

#[test]
fn validate_rejects_malformed_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("tasks.md"),
        "- [ ] Parser core <!-- files: a.go -->\n",
    )
    .expect("write tasks");

    let out = conductor(temp.path(), &["validate", "--tasks", "tasks.md"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("malformed task list (line 1)"));
}

#[test]
fn validate_rejects_out_of_range_parallelism() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("tasks.md"),
        "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n",
    )
    .expect("write tasks");

    let out = conductor(temp.path(), &["validate", "--tasks", "tasks.md", "--parallel", "6"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("max_parallel"));
}

#[test]
fn verdict_uses_last_marker() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("review.md"),
        "Status: PASS\n\nOn second look the error path is untested.\nStatus: NEEDS_ATTENTION\n",
    )
    .expect("write review");

    let out = conductor(temp.path(), &["verdict", "review.md"]);

    assert_eq!(out.status.code(), Some(exit_codes::ATTENTION));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "NEEDS_ATTENTION");
}

#[test]
fn verdict_of_empty_stdin_needs_attention() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = conductor(temp.path(), &["verdict"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "NEEDS_ATTENTION");
}

#[test]
fn restore_resets_tree_to_commit() {
    let repo = TestRepo::new().expect("repo");
    let head = repo.head().expect("head");
    repo.write("README.md", "edited\n").expect("write");
    repo.write("scratch/new.txt", "tmp\n").expect("write");

    let out = conductor(repo.root(), &["restore", &head]);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(repo.read("README.md").expect("read"), "hello\n");
    assert!(!repo.path("scratch/new.txt").exists());
}

#[test]
fn run_refuses_dirty_tree() {
    let repo = TestRepo::new().expect("repo");
    repo.write("notes.txt", "wip\n").expect("write");
    fs::write(
        repo.path("tasks.md"),
        "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n",
    )
    .expect("write tasks");

    let out = conductor(
        repo.root(),
        &["run", "--ticket", "T-1", "--tasks", "tasks.md"],
    );

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("working tree is dirty"));
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");

    let out = conductor(temp.path(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let path = temp.path().join(".conductor/config.toml");
    let written = fs::read_to_string(&path).expect("config");
    assert!(written.contains("max_parallel = 3"));
    assert!(temp.path().join(".conductor/.gitignore").exists());

    fs::write(&path, "max_parallel = 2\n").expect("edit");
    let out = conductor(temp.path(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(fs::read_to_string(&path).expect("config"), "max_parallel = 2\n");
}
