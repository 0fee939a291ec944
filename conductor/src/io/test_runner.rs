//! Scoped test runner: checks a task's changes before they are accepted.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::test_scope::{ProjectMarkers, plan_test_command};
use crate::io::process::run_command;

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Files the attempt touched, relative to `workdir`.
    pub files: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    /// No applicable test command; counts as success.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub status: TestStatus,
    /// Command line plus captured output; fed to the next correction attempt on failure.
    pub log: String,
}

impl TestOutcome {
    pub fn skipped() -> Self {
        Self {
            status: TestStatus::Skipped,
            log: String::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status != TestStatus::Fail
    }
}

pub trait TestRunner: Send + Sync {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome>;
}

/// Runs the configured test command, or one detected from project markers.
#[derive(Debug, Clone, Default)]
pub struct CommandTestRunner {
    template: Option<Vec<String>>,
}

impl CommandTestRunner {
    pub fn new(template: Option<Vec<String>>) -> Self {
        Self { template }
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(file_count = request.files.len()))]
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        let markers = detect_markers(&request.workdir);
        let Some(argv) = plan_test_command(markers, &request.files, self.template.as_deref())
        else {
            debug!("no test command applies; skipping");
            return Ok(TestOutcome::skipped());
        };
        let Some((program, args)) = argv.split_first() else {
            return Ok(TestOutcome::skipped());
        };

        info!(command = %argv.join(" "), "running scoped tests");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            request.cancel.as_ref(),
        )?;

        let mut log = format!("$ {}\n", argv.join(" "));
        log.push_str(&output.combined_text("tests"));
        if output.timed_out {
            log.push_str(&format!("\n[tests timed out after {:?}]\n", request.timeout));
        }
        let status = if output.status.success() && !output.timed_out && !output.cancelled {
            TestStatus::Pass
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "scoped tests failed");
            TestStatus::Fail
        };
        Ok(TestOutcome { status, log })
    }
}

/// Inspect the repository root for build-system markers.
pub fn detect_markers(root: &Path) -> ProjectMarkers {
    let exists = |name: &str| root.join(name).exists();
    ProjectMarkers {
        go_mod: exists("go.mod"),
        cargo: exists("Cargo.toml"),
        python: exists("pyproject.toml") || exists("setup.py") || exists("pytest.ini"),
        node: exists("package.json"),
    }
}
