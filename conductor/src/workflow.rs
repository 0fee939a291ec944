//! End-to-end run orchestration.
//!
//! One run walks a task list through:
//!
//! 1. Parse and validate the task list (fatal on structural errors).
//! 2. Capture the baseline.
//! 3. Phase 1: pending FUNDAMENTAL tasks one at a time, then review.
//! 4. Phase 2: pending INDEPENDENT tasks as one bounded parallel batch, then review.
//! 5. Final review over everything since the baseline.
//!
//! A NEEDS_REPLAN verdict restores the baseline and, when a planner is
//! available, starts over from step 1 with the regenerated task list, at most
//! `max_replans` times.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::scope::{CommitScope, find_scope_conflict, within_scope};
use crate::core::task_list::{TaskList, parse_task_list};
use crate::core::types::{Phase, Task, TaskCategory, TaskReport, TaskStatus, Verdict};
use crate::correction::{Brief, ExecSettings, TaskExecution, TaskRuntime, run_task};
use crate::events::{Event, EventSink};
use crate::exit_codes;
use crate::io::backend::Backend;
use crate::io::baseline::{Baseline, BaselineGuard};
use crate::io::config::{EngineConfig, validate_parallelism};
use crate::io::memory::TaskMemory;
use crate::io::run_log::{RunLog, new_run_id};
use crate::io::test_runner::TestRunner;
use crate::parallel::{BatchTaskError, CompletionPolicy, OverlappingScopesError, run_batch};
use crate::planner::{Planner, ReplanRequest};
use crate::retry::RetryPolicy;
use crate::review::{AttentionDecider, ReviewController, ReviewOutcome, Reviewer};

const FINAL_REVIEW: &str = "final review";

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub backend: &'a dyn Backend,
    pub tests: &'a dyn TestRunner,
    pub reviewer: &'a dyn Reviewer,
    pub decider: &'a dyn AttentionDecider,
    /// Regenerates the task list on NEEDS_REPLAN. `None` hands replanning to an operator.
    pub planner: Option<&'a dyn Planner>,
    pub events: &'a dyn EventSink,
}

#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub workdir: PathBuf,
    pub ticket: String,
    pub task_list: String,
    pub plan: Option<String>,
}

/// A phase could not finish. Names the task and the baseline to inspect or resume from.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{phase} failed at task '{task}'; baseline {baseline}")]
pub struct PhaseFailedError {
    pub phase: Phase,
    pub task: String,
    pub baseline: String,
}

/// Why a run ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    PhaseFailed(PhaseFailedError),
    /// The operator declined to continue past NEEDS_ATTENTION.
    Attention { label: String },
    /// Replanning is left to the operator, or the planner failed.
    ReplanRequired,
    ReplanLimit { replans: u32 },
}

/// State of one iteration, created at baseline capture.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub ticket: String,
    pub run_id: String,
    /// 0 for the initial task list, n after the n-th replan.
    pub iteration: u32,
    pub baseline: Baseline,
    pub phase: Option<Phase>,
    pub reports: Vec<TaskReport>,
    /// Verdict of the latest review that ran.
    pub verdict: Option<Verdict>,
    /// The tree was restored to the baseline, discarding this iteration's checkpoints.
    pub rolled_back: bool,
}

impl RunContext {
    fn new(ticket: &str, run_id: &str, iteration: u32, baseline: Baseline) -> Self {
        Self {
            ticket: ticket.to_string(),
            run_id: run_id.to_string(),
            iteration,
            baseline,
            phase: None,
            reports: Vec::new(),
            verdict: None,
            rolled_back: false,
        }
    }

    fn completed_names(&self, phase: Option<Phase>) -> Vec<String> {
        self.reports
            .iter()
            .filter(|r| r.status() == TaskStatus::Completed)
            .filter(|r| phase.is_none_or(|p| phase_of(r) == p))
            .map(|r| r.task.clone())
            .collect()
    }
}

fn phase_of(report: &TaskReport) -> Phase {
    match report.category {
        TaskCategory::Fundamental => Phase::Sequential,
        TaskCategory::Independent => Phase::Parallel,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedTask {
    pub name: String,
    pub checkpoint: Option<String>,
    pub attempts: usize,
    pub no_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub name: String,
    pub attempts: usize,
    pub error: Option<String>,
    pub cancelled: bool,
}

/// Final run summary, also written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ticket: String,
    pub run_id: String,
    pub baseline: String,
    pub completed: Vec<CompletedTask>,
    pub failed: Vec<FailedTask>,
    pub not_started: Vec<String>,
    /// Tasks already checked off in the task list.
    pub skipped: Vec<String>,
    /// Completed before a replan restore discarded their checkpoints.
    pub rolled_back: Vec<CompletedTask>,
    pub final_verdict: Option<Verdict>,
    pub replan_triggered: bool,
    pub replans: u32,
    pub stopped: Option<StopReason>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        match &self.stopped {
            Some(StopReason::PhaseFailed(_)) => exit_codes::FAILED,
            Some(StopReason::Attention { .. }) => exit_codes::ATTENTION,
            Some(StopReason::ReplanRequired | StopReason::ReplanLimit { .. }) => exit_codes::REPLAN,
            None if !self.failed.is_empty() => exit_codes::FAILED,
            None => exit_codes::OK,
        }
    }
}

enum IterationEnd {
    Finished,
    Stopped(StopReason),
    Replan { feedback: String },
}

/// Validate a task list the way a run does before touching the tree.
///
/// Besides the structural parse this rejects an out-of-range worker count and
/// overlapping scopes anywhere in the pending INDEPENDENT batch, which spans groups.
pub fn check_task_list(document: &str, max_parallel: usize) -> Result<TaskList> {
    let list = parse_task_list(document)?;
    validate_parallelism(max_parallel)?;
    let batch = pending(&list.independent());
    if let Some(conflict) = find_scope_conflict(batch.iter().copied()) {
        return Err(OverlappingScopesError {
            first: conflict.first,
            second: conflict.second,
            first_path: conflict.first_path,
            second_path: conflict.second_path,
        }
        .into());
    }
    Ok(list)
}

fn pending<'t>(tasks: &[&'t Task]) -> Vec<&'t Task> {
    tasks
        .iter()
        .copied()
        .filter(|task| task.status == TaskStatus::Pending)
        .collect()
}

/// Run a task list to completion, a stop, or the replan limit.
///
/// Errors are fatal configuration or infrastructure faults; every task-level
/// outcome is reported through the summary.
#[instrument(skip_all, fields(ticket = %input.ticket))]
pub fn run_workflow(
    config: &EngineConfig,
    collab: &Collaborators<'_>,
    input: &WorkflowInput,
) -> Result<RunSummary> {
    config.validate()?;
    let run_id = new_run_id();
    let runner = Runner {
        config,
        collab,
        input,
        guard: BaselineGuard::new(&input.workdir, config.dirty_tree_policy, config.diff.clone()),
        run_log: RunLog::new(&input.workdir, &input.ticket, &run_id),
    };
    let mut memory = if config.memory.enabled {
        Some(TaskMemory::load(TaskMemory::path_for(&input.workdir, &input.ticket))?)
    } else {
        None
    };
    info!(run_id = %run_id, "run started");

    let mut document = input.task_list.clone();
    let mut replans = 0u32;
    let mut replan_triggered = false;
    loop {
        let list = check_task_list(&document, config.max_parallel)?;
        let baseline = runner.guard.capture_baseline()?;
        info!(baseline = %baseline.commit, iteration = replans, "baseline captured");
        let mut ctx = RunContext::new(&input.ticket, &run_id, replans, baseline);

        let stopped = match runner.iterate(&mut ctx, &list, memory.as_mut())? {
            IterationEnd::Finished => None,
            IterationEnd::Stopped(reason) => Some(reason),
            IterationEnd::Replan { feedback } => {
                replan_triggered = true;
                collab.events.emit(&Event::ReplanRequested {
                    iteration: replans + 1,
                });
                match runner.next_task_list(&document, &feedback, replans) {
                    Ok(next) => {
                        replans += 1;
                        document = next;
                        continue;
                    }
                    Err(reason) => Some(reason),
                }
            }
        };

        let summary = summarize(&ctx, &list, replans, replan_triggered, stopped);
        runner
            .run_log
            .write_summary(&summary)
            .context("write run summary")?;
        info!(exit_code = summary.exit_code(), "run finished");
        return Ok(summary);
    }
}

struct Runner<'r> {
    config: &'r EngineConfig,
    collab: &'r Collaborators<'r>,
    input: &'r WorkflowInput,
    guard: BaselineGuard,
    run_log: RunLog,
}

impl Runner<'_> {
    fn settings(&self) -> ExecSettings {
        ExecSettings {
            max_self_corrections: self.config.max_self_corrections,
            retry: RetryPolicy::from(&self.config.retry),
            task_timeout: self.config.task_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
            memory_top_k: self.config.memory.top_k,
        }
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration, baseline = %ctx.baseline.commit))]
    fn iterate(
        &self,
        ctx: &mut RunContext,
        list: &TaskList,
        mut memory: Option<&mut TaskMemory>,
    ) -> Result<IterationEnd> {
        let baseline = ctx.baseline.clone();
        let rt = TaskRuntime {
            backend: self.collab.backend,
            tests: self.collab.tests,
            guard: &self.guard,
            baseline: &baseline,
            events: self.collab.events,
            run_log: Some(&self.run_log),
            plan: self.input.plan.as_deref(),
            settings: self.settings(),
        };
        let mut reviews = ReviewController::new(
            self.collab.reviewer,
            self.collab.decider,
            self.config.max_autofix_attempts,
            self.config.review_timeout(),
        );

        let sequential = pending(&list.fundamental());
        if !sequential.is_empty() {
            ctx.phase = Some(Phase::Sequential);
            self.phase_started(Phase::Sequential, sequential.len());
            for task in sequential.iter().copied() {
                let exec = TaskExecution {
                    task,
                    scope: CommitScope::Whole,
                    brief: Brief::Task,
                    cancel: None,
                    cancel_on_failure: false,
                };
                let report = run_task(&rt, &exec, memory.as_deref_mut())
                    .map_err(|err| self.fatal(ctx, Phase::Sequential, &task.name, err))?;
                let failed = report.status() != TaskStatus::Completed;
                ctx.reports.push(report);
                if failed {
                    self.phase_finished(ctx, Phase::Sequential);
                    return Ok(self.phase_failed(ctx, Phase::Sequential, &task.name));
                }
            }
            self.phase_finished(ctx, Phase::Sequential);
            let label = Phase::Sequential.to_string();
            let names = ctx.completed_names(Some(Phase::Sequential));
            if let Some(end) = self.review(&mut reviews, &rt, ctx, &label, &names)? {
                return Ok(end);
            }
        }

        let parallel = pending(&list.independent());
        if !parallel.is_empty() {
            ctx.phase = Some(Phase::Parallel);
            self.phase_started(Phase::Parallel, parallel.len());
            let cancel = CancelToken::new();
            let policy = CompletionPolicy::from_fail_fast(self.config.fail_fast);
            let outcome = run_batch(&rt, &parallel, self.config.max_parallel, policy, &cancel)
                .map_err(|err| {
                    let task = err
                        .downcast_ref::<BatchTaskError>()
                        .map_or_else(|| "parallel batch".to_string(), |e| e.task.clone());
                    self.fatal(ctx, Phase::Parallel, &task, err)
                })?;
            ctx.reports.extend(outcome.reports.iter().cloned());
            self.phase_finished(ctx, Phase::Parallel);
            self.discard_stray_changes(&rt, &parallel)?;

            if policy == CompletionPolicy::FailFast && !outcome.succeeded() {
                let culprit = outcome
                    .reports
                    .iter()
                    .find(|r| r.status() == TaskStatus::Failed && !r.was_cancelled())
                    .or_else(|| outcome.unfinished().next())
                    .map(|r| r.task.clone())
                    .unwrap_or_default();
                return Ok(self.phase_failed(ctx, Phase::Parallel, &culprit));
            }
            let label = Phase::Parallel.to_string();
            let names = ctx.completed_names(Some(Phase::Parallel));
            if let Some(end) = self.review(&mut reviews, &rt, ctx, &label, &names)? {
                return Ok(end);
            }
        }

        let names = ctx.completed_names(None);
        if let Some(end) = self.review(&mut reviews, &rt, ctx, FINAL_REVIEW, &names)? {
            return Ok(end);
        }
        Ok(IterationEnd::Finished)
    }

    fn review(
        &self,
        reviews: &mut ReviewController<'_>,
        rt: &TaskRuntime<'_>,
        ctx: &mut RunContext,
        label: &str,
        tasks: &[String],
    ) -> Result<Option<IterationEnd>> {
        if !self.config.review_enabled {
            return Ok(None);
        }
        let outcome = reviews.review(rt, label, tasks)?;
        if let Some(verdict) = outcome.verdict() {
            ctx.verdict = Some(verdict);
        }
        Ok(match outcome {
            ReviewOutcome::Skipped { reason } => {
                info!(label, reason = %reason, "review skipped");
                None
            }
            ReviewOutcome::Proceed {
                accepted_attention, ..
            } => {
                if accepted_attention {
                    warn!(label, "proceeding with unresolved review findings");
                }
                None
            }
            ReviewOutcome::Stop { .. } => Some(IterationEnd::Stopped(StopReason::Attention {
                label: label.to_string(),
            })),
            ReviewOutcome::Replan { review } => {
                ctx.rolled_back = true;
                Some(IterationEnd::Replan {
                    feedback: review.raw,
                })
            }
        })
    }

    /// Restore changes a batch left outside every declared scope.
    ///
    /// Workers only commit inside their own scope, so anything else is stray
    /// output that would otherwise leak into reviews and later checkpoints.
    fn discard_stray_changes(&self, rt: &TaskRuntime<'_>, batch: &[&Task]) -> Result<()> {
        let stray: Vec<String> = self
            .guard
            .changed_paths()?
            .into_iter()
            .filter(|path| !rt.baseline.dirty_paths.contains(path))
            .filter(|path| !batch.iter().any(|task| within_scope(path, &task.files)))
            .collect();
        if stray.is_empty() {
            return Ok(());
        }
        warn!(paths = ?stray, "parallel tasks changed files outside their scope; discarding");
        self.guard
            .restore_paths(&stray)
            .context("discard out-of-scope changes")
    }

    fn phase_started(&self, phase: Phase, tasks: usize) {
        info!(%phase, tasks, "phase started");
        self.collab.events.emit(&Event::PhaseStarted { phase, tasks });
    }

    fn phase_finished(&self, ctx: &RunContext, phase: Phase) {
        let reports = ctx.reports.iter().filter(|r| phase_of(r) == phase);
        let (mut completed, mut failed) = (0, 0);
        for report in reports {
            match report.status() {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        self.collab.events.emit(&Event::PhaseFinished {
            phase,
            completed,
            failed,
        });
    }

    fn phase_failed(&self, ctx: &RunContext, phase: Phase, task: &str) -> IterationEnd {
        let err = PhaseFailedError {
            phase,
            task: task.to_string(),
            baseline: ctx.baseline.commit.clone(),
        };
        warn!(err = %err, "stopping run");
        IterationEnd::Stopped(StopReason::PhaseFailed(err))
    }

    /// Attach phase, task and baseline to an infrastructure fault.
    fn fatal(
        &self,
        ctx: &RunContext,
        phase: Phase,
        task: &str,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let failed = PhaseFailedError {
            phase,
            task: task.to_string(),
            baseline: ctx.baseline.commit.clone(),
        };
        warn!(err = %format!("{err:#}"), "{failed}");
        err.context(failed)
    }

    /// Ask the planner for the next task list, or explain why there is none.
    fn next_task_list(
        &self,
        document: &str,
        feedback: &str,
        replans: u32,
    ) -> Result<String, StopReason> {
        let Some(planner) = self.collab.planner else {
            warn!("review requested a replan; edit the task list and run again");
            return Err(StopReason::ReplanRequired);
        };
        if replans >= self.config.max_replans {
            warn!(replans, "replan limit reached");
            return Err(StopReason::ReplanLimit { replans });
        }
        let request = ReplanRequest {
            feedback,
            plan: self.input.plan.as_deref(),
            task_list: document,
            iteration: replans + 1,
        };
        let next = match planner.replan(&request) {
            Ok(next) => next,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "planner failed");
                return Err(StopReason::ReplanRequired);
            }
        };
        if let Err(err) = self.run_log.write_task_list(replans + 1, &next) {
            warn!(err = %format!("{err:#}"), "failed to keep replanned task list");
        }
        info!(iteration = replans + 1, "replanned; re-entering phase 1");
        Ok(next)
    }
}

fn summarize(
    ctx: &RunContext,
    list: &TaskList,
    replans: u32,
    replan_triggered: bool,
    stopped: Option<StopReason>,
) -> RunSummary {
    let mut completed = Vec::new();
    let mut failed = Vec::new();
    for report in &ctx.reports {
        match report.status() {
            TaskStatus::Completed => completed.push(CompletedTask {
                name: report.task.clone(),
                checkpoint: report.checkpoint.clone(),
                attempts: report.attempts.len(),
                no_changes: report.no_changes,
            }),
            TaskStatus::Failed => failed.push(FailedTask {
                name: report.task.clone(),
                attempts: report.attempts.len(),
                error: report.last_error().map(str::to_string),
                cancelled: report.was_cancelled(),
            }),
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }
    let started = |name: &str| {
        ctx.reports
            .iter()
            .any(|r| r.task == name && r.status() != TaskStatus::Pending)
    };
    let not_started = list
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending && !started(&task.name))
        .map(|task| task.name.clone())
        .collect();
    let skipped = list
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .map(|task| task.name.clone())
        .collect();
    let rolled_back = if ctx.rolled_back {
        std::mem::take(&mut completed)
    } else {
        Vec::new()
    };

    RunSummary {
        ticket: ctx.ticket.clone(),
        run_id: ctx.run_id.clone(),
        baseline: ctx.baseline.commit.clone(),
        completed,
        failed,
        not_started,
        skipped,
        rolled_back,
        final_verdict: ctx.verdict,
        replan_triggered,
        replans,
        stopped,
    }
}
