//! Self-correction loop around a single task.
//!
//! Each attempt is a fresh backend session. A failed attempt's diagnostic
//! output (backend error, non-zero exit output, or scoped test log) is
//! embedded verbatim in the next attempt's prompt; nothing else carries over.
//! Working-tree changes do carry over between attempts, and a task that
//! exhausts its budget has its own changes restored to HEAD.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::memory::{MemoryEntry, extract_learnings};
use crate::core::scope::{CommitScope, select_task_paths};
use crate::core::types::{Attempt, AttemptOutcome, Task, TaskReport};
use crate::events::{Event, EventSink};
use crate::io::backend::{Backend, BackendRequest, BackendResponse, is_cancelled, is_rate_limited};
use crate::io::baseline::{Baseline, BaselineGuard, CheckpointOutcome};
use crate::io::memory::TaskMemory;
use crate::io::prompt::{AutofixPrompt, TaskPrompt, render_autofix, render_task};
use crate::io::run_log::RunLog;
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::retry::{RetryPolicy, with_retry_observed};

/// Numeric knobs for task execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecSettings {
    /// Extra attempts after the first; 0 means exactly one attempt.
    pub max_self_corrections: u32,
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    pub output_limit_bytes: usize,
    pub memory_top_k: usize,
}

/// Shared collaborators for executing tasks. Safe to share across workers.
#[derive(Clone, Copy)]
pub struct TaskRuntime<'a> {
    pub backend: &'a dyn Backend,
    pub tests: &'a dyn TestRunner,
    pub guard: &'a BaselineGuard,
    pub baseline: &'a Baseline,
    pub events: &'a dyn EventSink,
    pub run_log: Option<&'a RunLog>,
    pub plan: Option<&'a str>,
    pub settings: ExecSettings,
}

/// What the backend is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum Brief<'a> {
    /// Implement the task as declared.
    Task,
    /// Address review feedback; the feedback plays the role of the prior error.
    Autofix {
        label: &'a str,
        round: u32,
        feedback: &'a str,
    },
}

/// One task execution request.
#[derive(Clone, Copy)]
pub struct TaskExecution<'a> {
    pub task: &'a Task,
    pub scope: CommitScope,
    pub brief: Brief<'a>,
    pub cancel: Option<&'a CancelToken>,
    /// Fire `cancel` as soon as this task fails terminally.
    pub cancel_on_failure: bool,
}

/// Result of evaluating one attempt, before it is recorded.
struct AttemptResult {
    outcome: AttemptOutcome,
    output: String,
    error: Option<String>,
    changed: Vec<String>,
}

impl AttemptResult {
    fn failed(output: String, error: String, changed: Vec<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Failed,
            output,
            error: Some(error),
            changed,
        }
    }

    fn cancelled(output: String, changed: Vec<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Cancelled,
            output,
            error: Some("cancelled".to_string()),
            changed,
        }
    }
}

/// Run one task through the self-correction loop.
///
/// `memory` is consulted for hints and appended to on success; callers pass
/// `None` wherever sharing unverified outcomes would be unsafe (parallel batches).
/// Errors are reserved for infrastructure faults (git, filesystem); task
/// failures come back as a report whose status is FAILED. On an error the
/// task's uncommitted changes are dropped before it is returned.
#[instrument(skip_all, fields(task = %exec.task.name, scope = ?exec.scope))]
pub fn run_task(
    rt: &TaskRuntime<'_>,
    exec: &TaskExecution<'_>,
    memory: Option<&mut TaskMemory>,
) -> Result<TaskReport> {
    let mut touched = BTreeSet::new();
    attempt_loop(rt, exec, memory, &mut touched).inspect_err(|_| abandon(rt, exec, &touched))
}

fn attempt_loop(
    rt: &TaskRuntime<'_>,
    exec: &TaskExecution<'_>,
    mut memory: Option<&mut TaskMemory>,
    touched: &mut BTreeSet<String>,
) -> Result<TaskReport> {
    let task = exec.task;
    let mut report = TaskReport::new(task);
    let hints: Vec<MemoryEntry> = memory
        .as_deref()
        .map(|store| store.retrieve(&task.summary_text(), rt.settings.memory_top_k))
        .unwrap_or_default();
    if !hints.is_empty() {
        debug!(hints = hints.len(), "using task memory hints");
    }

    let max_index = rt.settings.max_self_corrections;
    let mut prior_error: Option<String> = None;

    for index in 0..=max_index {
        if is_token_cancelled(exec.cancel) {
            info!(attempt = index, "cancelled before attempt");
            if index == 0 {
                rt.events.emit(&Event::TaskCancelled {
                    task: task.name.clone(),
                });
                return Ok(report);
            }
            break;
        }
        if let Some(error) = &prior_error {
            rt.events.emit(&Event::TaskRetrying {
                task: task.name.clone(),
                attempt: index,
                reason: first_line(error),
            });
        }
        rt.events.emit(&Event::TaskStarted {
            task: task.name.clone(),
            attempt: index,
        });

        let prompt = build_prompt(rt, exec, index, prior_error.as_deref(), &hints)?;
        let mut result = run_attempt(rt, exec, index, &prompt)?;
        touched.extend(result.changed.iter().cloned());

        if result.outcome == AttemptOutcome::Succeeded {
            let message = checkpoint_message(exec);
            let checkpoint = rt
                .guard
                .commit_checkpoint(&message, &result.changed, exec.cancel)
                .with_context(|| format!("checkpoint for task '{}'", task.name))?;
            match checkpoint {
                CheckpointOutcome::Committed(sha) => report.checkpoint = Some(sha),
                CheckpointOutcome::NothingToCommit => report.no_changes = true,
                CheckpointOutcome::Cancelled => {
                    result = AttemptResult::cancelled(result.output, result.changed);
                }
            }
        }

        write_attempt_log(rt, task, index, &prompt, &result);
        let outcome = result.outcome;
        let output = result.output;
        report.attempts.push(Attempt {
            index,
            outcome,
            output: output.clone(),
            error: result.error.clone(),
            changed_files: result.changed,
        });

        match outcome {
            AttemptOutcome::Succeeded => {
                if report.no_changes {
                    info!(attempt = index, "task succeeded without changes");
                }
                rt.events.emit(&Event::TaskSucceeded {
                    task: task.name.clone(),
                    attempt: index,
                    checkpoint: report.checkpoint.clone(),
                });
                if let Some(store) = memory.as_deref_mut() {
                    store
                        .record_outcome(&task.name, extract_learnings(&output))
                        .context("record task memory")?;
                }
                return Ok(report);
            }
            AttemptOutcome::Cancelled => break,
            AttemptOutcome::Failed => {
                warn!(attempt = index, remaining = max_index - index, "attempt failed");
                prior_error = result.error;
            }
        }
    }

    finish_unsuccessful(rt, exec, &report, touched)?;
    Ok(report)
}

/// Cleanup after an infrastructure fault: stop siblings and drop this task's
/// uncommitted changes so nothing is left staged behind the error.
fn abandon(rt: &TaskRuntime<'_>, exec: &TaskExecution<'_>, touched: &BTreeSet<String>) {
    if exec.cancel_on_failure {
        if let Some(token) = exec.cancel {
            token.cancel();
        }
    }
    let paths: Vec<String> = touched.iter().cloned().collect();
    if let Err(err) = rt.guard.restore_paths(&paths) {
        warn!(err = %format!("{err:#}"), "failed to restore task changes after error");
    }
}

fn finish_unsuccessful(
    rt: &TaskRuntime<'_>,
    exec: &TaskExecution<'_>,
    report: &TaskReport,
    touched: &BTreeSet<String>,
) -> Result<()> {
    let cancelled = report.was_cancelled() || report.attempts.is_empty();
    if !cancelled && exec.cancel_on_failure {
        if let Some(token) = exec.cancel {
            token.cancel();
        }
    }

    let touched: Vec<String> = touched.iter().cloned().collect();
    if !touched.is_empty() {
        info!(paths = touched.len(), "restoring task changes to last checkpoint");
        rt.guard
            .restore_paths(&touched)
            .with_context(|| format!("restore changes of task '{}'", exec.task.name))?;
    }

    if cancelled {
        rt.events.emit(&Event::TaskCancelled {
            task: exec.task.name.clone(),
        });
    } else {
        rt.events.emit(&Event::TaskFailed {
            task: exec.task.name.clone(),
            attempts: report.attempts.len() as u32,
            error: report
                .last_error()
                .map(first_line)
                .unwrap_or_else(|| "unknown error".to_string()),
        });
    }
    Ok(())
}

fn build_prompt(
    rt: &TaskRuntime<'_>,
    exec: &TaskExecution<'_>,
    index: u32,
    prior_error: Option<&str>,
    hints: &[MemoryEntry],
) -> Result<String> {
    match exec.brief {
        Brief::Task => render_task(&TaskPrompt {
            task: exec.task,
            plan: rt.plan,
            attempt: index.saturating_sub(1),
            prior_error,
            memory: hints,
        }),
        Brief::Autofix {
            label,
            round,
            feedback,
        } => render_autofix(&AutofixPrompt {
            label,
            round,
            feedback: prior_error.unwrap_or(feedback),
            stat: None,
        }),
    }
}

fn run_attempt(
    rt: &TaskRuntime<'_>,
    exec: &TaskExecution<'_>,
    index: u32,
    prompt: &str,
) -> Result<AttemptResult> {
    let request = BackendRequest {
        workdir: rt.guard.workdir().to_path_buf(),
        prompt: prompt.to_string(),
        fresh_session: true,
        timeout: rt.settings.task_timeout,
        output_limit_bytes: rt.settings.output_limit_bytes,
        cancel: exec.cancel.cloned(),
    };
    let call = with_retry_observed(
        rt.settings.retry,
        exec.cancel,
        is_rate_limited,
        |retry, delay, _| {
            rt.events.emit(&Event::TaskRetrying {
                task: exec.task.name.clone(),
                attempt: index,
                reason: format!("rate limited; retry {retry} in {}ms", delay.as_millis()),
            });
        },
        |_| rt.backend.execute(&request),
    );

    let response = match call {
        Ok(response) => response,
        Err(err) if is_cancelled(&err) => {
            return Ok(AttemptResult::cancelled(String::new(), task_changes(rt, exec)?));
        }
        Err(err) => {
            let changed = task_changes(rt, exec)?;
            return Ok(settle_failure(
                exec,
                AttemptResult::failed(String::new(), format!("{err:#}"), changed),
            ));
        }
    };

    let changed = task_changes(rt, exec)?;
    if !response.success() {
        let error = exit_failure_text(&response);
        return Ok(settle_failure(
            exec,
            AttemptResult::failed(response.text, error, changed),
        ));
    }
    if changed.is_empty() {
        debug!("backend reported success with no changes in scope");
        return Ok(AttemptResult {
            outcome: AttemptOutcome::Succeeded,
            output: response.text,
            error: None,
            changed,
        });
    }

    let outcome = rt.tests.run(&TestRequest {
        workdir: rt.guard.workdir().to_path_buf(),
        files: changed.clone(),
        timeout: rt.settings.task_timeout,
        output_limit_bytes: rt.settings.output_limit_bytes,
        cancel: exec.cancel.cloned(),
    });
    let result = match outcome {
        Ok(outcome) if outcome.passed() => AttemptResult {
            outcome: AttemptOutcome::Succeeded,
            output: response.text,
            error: None,
            changed,
        },
        Ok(outcome) => AttemptResult::failed(
            response.text,
            format!("scoped tests failed:\n{}", outcome.log),
            changed,
        ),
        Err(err) => AttemptResult::failed(
            response.text,
            format!("scoped tests could not run: {err:#}"),
            changed,
        ),
    };
    Ok(settle_failure(exec, result))
}

/// A failure observed after the batch was cancelled is reported as a cancellation.
fn settle_failure(exec: &TaskExecution<'_>, result: AttemptResult) -> AttemptResult {
    if result.outcome == AttemptOutcome::Failed && is_token_cancelled(exec.cancel) {
        return AttemptResult::cancelled(result.output, result.changed);
    }
    result
}

fn task_changes(rt: &TaskRuntime<'_>, exec: &TaskExecution<'_>) -> Result<Vec<String>> {
    let changed = rt.guard.changed_paths()?;
    Ok(select_task_paths(
        &changed,
        &exec.task.files,
        &rt.baseline.dirty_paths,
        exec.scope,
    ))
}

fn exit_failure_text(response: &BackendResponse) -> String {
    let code = response
        .exit_code
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    format!("backend exited with status {code}\n{}", response.text.trim_end())
}

fn checkpoint_message(exec: &TaskExecution<'_>) -> String {
    match exec.brief {
        Brief::Task => format!("conductor: {}", exec.task.name),
        Brief::Autofix { label, round, .. } => {
            format!("conductor: autofix {label} (round {round})")
        }
    }
}

fn write_attempt_log(
    rt: &TaskRuntime<'_>,
    task: &Task,
    index: u32,
    prompt: &str,
    result: &AttemptResult,
) {
    let Some(log) = rt.run_log else {
        return;
    };
    let mut buf = format!("=== outcome: {:?} ===\n", result.outcome);
    buf.push_str("\n=== prompt ===\n");
    buf.push_str(prompt);
    buf.push_str("\n=== output ===\n");
    buf.push_str(&result.output);
    if let Some(error) = &result.error {
        buf.push_str("\n=== error ===\n");
        buf.push_str(error);
    }
    if !result.changed.is_empty() {
        buf.push_str("\n=== changed files ===\n");
        buf.push_str(&result.changed.join("\n"));
    }
    buf.push('\n');
    if let Err(err) = log.write_attempt(&task.name, index, &buf) {
        warn!(err = %format!("{err:#}"), "failed to write attempt log");
    }
}

fn is_token_cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(CancelToken::is_cancelled)
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .chars()
        .take(200)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::io::config::{DiffConfig, DirtyTreePolicy};
    use crate::io::test_runner::{TestOutcome, TestStatus};
    use crate::test_support::{
        CollectingSink, ScriptedBackend, ScriptedStep, ScriptedTestRunner, TestRepo, task,
    };

    fn settings(max_self_corrections: u32) -> ExecSettings {
        ExecSettings {
            max_self_corrections,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            task_timeout: Duration::from_secs(30),
            output_limit_bytes: 100_000,
            memory_top_k: 3,
        }
    }

    struct Fixture {
        repo: TestRepo,
        guard: BaselineGuard,
        baseline: Baseline,
        sink: CollectingSink,
    }

    fn fixture() -> Fixture {
        let repo = TestRepo::new().expect("repo");
        let guard = BaselineGuard::new(repo.root(), DirtyTreePolicy::FailFast, DiffConfig::default());
        let baseline = guard.capture_baseline().expect("baseline");
        Fixture {
            repo,
            guard,
            baseline,
            sink: CollectingSink::default(),
        }
    }

    fn runtime<'a>(
        fx: &'a Fixture,
        backend: &'a ScriptedBackend,
        tests: &'a ScriptedTestRunner,
        max_self_corrections: u32,
    ) -> TaskRuntime<'a> {
        TaskRuntime {
            backend,
            tests,
            guard: &fx.guard,
            baseline: &fx.baseline,
            events: &fx.sink,
            run_log: None,
            plan: None,
            settings: settings(max_self_corrections),
        }
    }

    fn exec(task: &Task) -> TaskExecution<'_> {
        TaskExecution {
            task,
            scope: CommitScope::Declared,
            brief: Brief::Task,
            cancel: None,
            cancel_on_failure: false,
        }
    }

    #[test]
    fn succeeds_on_third_attempt_with_budget() {
        let fx = fixture();
        let backend = ScriptedBackend::new().script(
            "Build parser",
            vec![
                ScriptedStep::fail("syntax error in parser.rs"),
                ScriptedStep::fail("type mismatch"),
                ScriptedStep::ok("done").write("parser.rs", "fn parse() {}\n"),
            ],
        );
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 3);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.attempts.len(), 3);
        assert!(report.checkpoint.is_some());

        let prompts = backend.prompts_for("Build parser");
        assert!(!prompts[0].contains("Previous attempt failed"));
        assert!(prompts[1].contains("syntax error in parser.rs"));
        assert!(prompts[2].contains("type mismatch"));
        assert!(!prompts[2].contains("syntax error in parser.rs"));
        assert!(backend.calls().iter().all(|call| call.fresh_session));
    }

    #[test]
    fn exhausts_budget_and_restores_changes() {
        let fx = fixture();
        let backend = ScriptedBackend::new().script(
            "Build parser",
            vec![
                ScriptedStep::fail("broken").write("parser.rs", "garbage\n"),
                ScriptedStep::fail("still broken"),
                ScriptedStep::ok("never reached"),
            ],
        );
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 1);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.status(), TaskStatus::Failed);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.checkpoint, None);
        assert!(!fx.repo.root().join("parser.rs").exists());
        assert!(
            fx.sink
                .events()
                .iter()
                .any(|e| matches!(e, Event::TaskFailed { attempts: 2, .. }))
        );
    }

    #[test]
    fn zero_budget_means_single_attempt() {
        let fx = fixture();
        let backend =
            ScriptedBackend::new().script("Build parser", vec![ScriptedStep::fail("nope")]);
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 0);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.status(), TaskStatus::Failed);
    }

    #[test]
    fn failing_tests_trigger_self_correction() {
        let fx = fixture();
        let backend = ScriptedBackend::new().script(
            "Build parser",
            vec![
                ScriptedStep::ok("first").write("parser.rs", "v1\n"),
                ScriptedStep::ok("second").write("parser.rs", "v2\n"),
            ],
        );
        let tests = ScriptedTestRunner::new(vec![
            TestOutcome {
                status: TestStatus::Fail,
                log: "assertion failed: parse(\"\")".to_string(),
            },
            TestOutcome {
                status: TestStatus::Pass,
                log: String::new(),
            },
        ]);
        let rt = runtime(&fx, &backend, &tests, 2);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.attempts.len(), 2);
        assert!(backend.prompts_for("Build parser")[1].contains("assertion failed"));
        assert_eq!(tests.requested_files(), vec![vec!["parser.rs".to_string()]; 2]);
        assert_eq!(fx.repo.read("parser.rs").expect("read"), "v2\n");
    }

    #[test]
    fn rate_limits_are_retried_within_one_attempt() {
        let fx = fixture();
        let backend = ScriptedBackend::new().script(
            "Build parser",
            vec![
                ScriptedStep::rate_limited(),
                ScriptedStep::ok("ok").write("parser.rs", "ok\n"),
            ],
        );
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 0);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(backend.prompts_for("Build parser").len(), 2);
    }

    #[test]
    fn success_without_changes_completes_without_checkpoint() {
        let fx = fixture();
        let backend =
            ScriptedBackend::new().script("Build parser", vec![ScriptedStep::ok("nothing to do")]);
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 0);
        let task = task("Build parser", &["parser.rs"]);

        let report = run_task(&rt, &exec(&task), None).expect("run");
        assert_eq!(report.status(), TaskStatus::Completed);
        assert!(report.no_changes);
        assert_eq!(report.checkpoint, None);
        assert!(tests.requested_files().is_empty());
    }

    #[test]
    fn memory_hints_flow_into_prompt_and_learnings_are_recorded() {
        let fx = fixture();
        let backend = ScriptedBackend::new()
            .script(
                "Add config loader",
                vec![
                    ScriptedStep::ok("PATTERN: config errors name the file")
                        .write("config.go", "package config\n"),
                ],
            )
            .script(
                "Extend config loader",
                vec![ScriptedStep::ok("done").write("config_env.go", "package config\n")],
            );
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 0);
        let mut memory = TaskMemory::in_memory();

        let first = task("Add config loader", &["config.go"]);
        run_task(&rt, &exec(&first), Some(&mut memory)).expect("run");
        let second = task("Extend config loader", &["config_env.go"]);
        run_task(&rt, &exec(&second), Some(&mut memory)).expect("run");

        assert_eq!(memory.entries().len(), 2);
        let prompt = &backend.prompts_for("Extend config loader")[0];
        assert!(prompt.contains("config errors name the file"));
    }

    #[test]
    fn failed_checkpoint_leaves_nothing_staged() {
        let fx = fixture();
        fx.repo.git(&["config", "user.name", ""]).expect("config");
        let backend = ScriptedBackend::new().script(
            "Build parser",
            vec![ScriptedStep::ok("done").write("parser.rs", "fn parse() {}\n")],
        );
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 0);
        let task = task("Build parser", &["parser.rs"]);
        let token = CancelToken::new();
        let mut request = exec(&task);
        request.cancel = Some(&token);
        request.cancel_on_failure = true;

        let err = run_task(&rt, &request, None).expect_err("commit fails");
        assert!(format!("{err:#}").contains("checkpoint for task 'Build parser'"));
        assert_eq!(fx.repo.status().expect("status"), "");
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelled_token_prevents_any_attempt() {
        let fx = fixture();
        let backend = ScriptedBackend::new();
        let tests = ScriptedTestRunner::default();
        let rt = runtime(&fx, &backend, &tests, 3);
        let task = task("Build parser", &["parser.rs"]);
        let token = CancelToken::new();
        token.cancel();
        let mut request = exec(&task);
        request.cancel = Some(&token);

        let report = run_task(&rt, &request, None).expect("run");
        assert_eq!(report.status(), TaskStatus::Pending);
        assert!(backend.calls().is_empty());
    }
}
