//! Test-only helpers: scratch git repositories and scripted collaborators.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::scope::normalize_path;
use crate::core::types::{Task, TaskCategory, TaskStatus};
use crate::events::{Event, EventSink};
use crate::io::backend::{Backend, BackendError, BackendRequest, BackendResponse};
use crate::io::test_runner::{TestOutcome, TestRequest, TestRunner};
use crate::review::{ReviewRequest, Reviewer};

/// A git repository in a temporary directory with one initial commit
/// (`README.md` containing `hello\n`).
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "dev@example.com"])?;
        repo.git(&["config", "user.name", "Dev"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "hello\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_file(self.root(), rel, contents)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit; returns the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "--allow-empty", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Commit subjects after `base`, oldest first.
    pub fn subjects_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let out = self.git(&["log", "--reverse", "--format=%s", &range])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Porcelain status, ignoring nothing.
    pub fn status(&self) -> Result<String> {
        self.git(&["status", "--porcelain", "-uall"])
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn write_file(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

#[derive(Debug, Clone)]
enum StepResult {
    Exit(i32),
    RateLimited,
    TimedOut,
}

/// One scripted backend reply, applied to the request's working directory.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    text: String,
    result: StepResult,
    writes: Vec<(String, String)>,
    delay: Duration,
}

impl ScriptedStep {
    /// Exit 0 with `text` as output.
    pub fn ok(text: &str) -> Self {
        Self {
            text: text.to_string(),
            result: StepResult::Exit(0),
            writes: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    /// Exit 1 with `text` as output.
    pub fn fail(text: &str) -> Self {
        Self {
            result: StepResult::Exit(1),
            ..Self::ok(text)
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            result: StepResult::RateLimited,
            ..Self::ok("429 Too Many Requests")
        }
    }

    pub fn timed_out() -> Self {
        Self {
            result: StepResult::TimedOut,
            ..Self::ok("")
        }
    }

    /// Write a file before replying.
    pub fn write(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }

    /// Block for `delay` after writing, waking early on cancellation.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A recorded backend call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// Script key the prompt matched, if any.
    pub key: Option<String>,
    pub prompt: String,
    pub fresh_session: bool,
}

/// Backend replaying per-key scripts.
///
/// A prompt selects the script whose key occurs earliest in it (longest key
/// on ties). Exhausted or unmatched scripts reply `ok("done")`.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<Vec<(String, VecDeque<ScriptedStep>)>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, key: &str, steps: Vec<ScriptedStep>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push((key.to_string(), steps.into()));
        }
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn prompts_for(&self, key: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.key.as_deref() == Some(key))
            .map(|call| call.prompt)
            .collect()
    }

    fn next_step(&self, prompt: &str) -> (Option<String>, ScriptedStep) {
        let Ok(mut scripts) = self.scripts.lock() else {
            return (None, ScriptedStep::ok("done"));
        };
        let chosen = scripts
            .iter()
            .enumerate()
            .filter_map(|(i, (key, _))| prompt.find(key.as_str()).map(|pos| (pos, key.len(), i)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, _, i)| i);
        match chosen {
            Some(i) => {
                let (key, steps) = &mut scripts[i];
                let step = steps.pop_front().unwrap_or_else(|| ScriptedStep::ok("done"));
                (Some(key.clone()), step)
            }
            None => (None, ScriptedStep::ok("done")),
        }
    }
}

impl Backend for ScriptedBackend {
    fn execute(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let (key, step) = self.next_step(&request.prompt);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ScriptedCall {
                key,
                prompt: request.prompt.clone(),
                fresh_session: request.fresh_session,
            });
        }
        for (rel, contents) in &step.writes {
            write_file(&request.workdir, rel, contents)?;
        }
        if !step.delay.is_zero() {
            match &request.cancel {
                Some(token) => {
                    if !token.sleep(step.delay) {
                        return Err(BackendError::Cancelled.into());
                    }
                }
                None => std::thread::sleep(step.delay),
            }
        }
        match step.result {
            StepResult::Exit(code) => Ok(BackendResponse {
                text: step.text,
                exit_code: Some(code),
            }),
            StepResult::RateLimited => Err(BackendError::RateLimited(step.text).into()),
            StepResult::TimedOut => Err(BackendError::TimedOut(request.timeout).into()),
        }
    }
}

/// A recorded review request.
#[derive(Debug, Clone)]
pub struct ReviewCall {
    pub label: String,
    pub diff: String,
}

/// Reviewer replaying queued replies; replies `Status: PASS` once exhausted.
#[derive(Default)]
pub struct ScriptedReviewer {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<ReviewCall>>,
}

impl ScriptedReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(text.to_string()));
        }
        self
    }

    /// Queue a reviewer crash.
    pub fn crash(self, message: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(message.to_string()));
        }
        self
    }

    pub fn calls(&self) -> Vec<ReviewCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(&self, request: &ReviewRequest<'_>) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ReviewCall {
                label: request.label.to_string(),
                diff: request.diff.text.clone(),
            });
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Ok("Status: PASS".to_string()));
        reply.map_err(|message| anyhow!(message))
    }
}

/// Test runner replaying queued outcomes; reports Skipped once exhausted.
#[derive(Default)]
pub struct ScriptedTestRunner {
    outcomes: Mutex<VecDeque<TestOutcome>>,
    requests: Mutex<Vec<Vec<String>>>,
}

impl ScriptedTestRunner {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::default(),
        }
    }

    pub fn requested_files(&self) -> Vec<Vec<String>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.files.clone());
        }
        Ok(self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or_else(TestOutcome::skipped))
    }
}

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// A pending INDEPENDENT task in group `default`.
pub fn task(name: &str, files: &[&str]) -> Task {
    Task {
        name: name.to_string(),
        description: String::new(),
        category: TaskCategory::Independent,
        order: None,
        group: Some("default".to_string()),
        files: files_set(files),
        status: TaskStatus::Pending,
        line: 0,
    }
}

/// A pending FUNDAMENTAL task.
pub fn fundamental(name: &str, order: u32, files: &[&str]) -> Task {
    Task {
        category: TaskCategory::Fundamental,
        order: Some(order),
        group: None,
        ..task(name, files)
    }
}

fn files_set(files: &[&str]) -> BTreeSet<String> {
    files.iter().map(|f| normalize_path(f)).collect()
}
