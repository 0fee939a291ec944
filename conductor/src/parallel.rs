//! Bounded worker pool for a batch of INDEPENDENT tasks.
//!
//! Workers pull task indices from a shared queue and run each task through
//! the self-correction loop with its own backend session and no task memory.
//! The only shared mutable state is the baseline guard, whose checkpoint
//! commits are serialized by its lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use thiserror::Error;
use tracing::{Span, debug, info, info_span, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::scope::{CommitScope, find_scope_conflict};
use crate::core::types::{Task, TaskReport, TaskStatus};
use crate::correction::{Brief, TaskExecution, TaskRuntime, run_task};
use crate::events::Event;
use crate::io::config::validate_parallelism;

/// How a batch reacts to a terminal task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Cancel every task still pending or running.
    FailFast,
    /// Let every task run to completion or exhaustion.
    ContinueOnError,
}

impl CompletionPolicy {
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            CompletionPolicy::FailFast
        } else {
            CompletionPolicy::ContinueOnError
        }
    }
}

/// Two tasks of one batch declare overlapping files. No worker was started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "tasks '{first}' and '{second}' declare overlapping files ({first_path} / {second_path}); batch not started"
)]
pub struct OverlappingScopesError {
    pub first: String,
    pub second: String,
    pub first_path: String,
    pub second_path: String,
}

/// A worker hit an infrastructure fault while running `task`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task}' in parallel batch")]
pub struct BatchTaskError {
    pub task: String,
}

/// Per-task results of one batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub reports: Vec<TaskReport>,
    /// The batch cancellation token fired.
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn completed(&self) -> impl Iterator<Item = &TaskReport> {
        self.reports
            .iter()
            .filter(|report| report.status() == TaskStatus::Completed)
    }

    /// Tasks that did not complete: failed, cancelled, or never started.
    pub fn unfinished(&self) -> impl Iterator<Item = &TaskReport> {
        self.reports
            .iter()
            .filter(|report| report.status() != TaskStatus::Completed)
    }

    pub fn succeeded(&self) -> bool {
        self.unfinished().next().is_none()
    }
}

/// Run `tasks` on up to `max_parallel` workers.
///
/// Fails before starting any worker when `max_parallel` is outside `1..=5`
/// ([`crate::io::config::InvalidConfigError`]) or when two tasks' file scopes
/// overlap ([`OverlappingScopesError`]).
#[instrument(skip_all, fields(tasks = tasks.len(), max_parallel = max_parallel, policy = ?policy))]
pub fn run_batch(
    rt: &TaskRuntime<'_>,
    tasks: &[&Task],
    max_parallel: usize,
    policy: CompletionPolicy,
    cancel: &CancelToken,
) -> Result<BatchOutcome> {
    validate_parallelism(max_parallel)?;
    if let Some(conflict) = find_scope_conflict(tasks.iter().copied()) {
        return Err(OverlappingScopesError {
            first: conflict.first,
            second: conflict.second,
            first_path: conflict.first_path,
            second_path: conflict.second_path,
        }
        .into());
    }
    if tasks.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..tasks.len()).collect());
    let workers = max_parallel.min(tasks.len());
    let (tx, rx) = mpsc::channel::<(usize, Result<TaskReport>)>();
    let parent = Span::current();
    info!(workers, "starting worker pool");

    let mut results: Vec<Option<Result<TaskReport>>> = (0..tasks.len()).map(|_| None).collect();
    thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let parent = &parent;
            scope.spawn(move || {
                let _span = info_span!(parent: parent, "worker", worker).entered();
                while let Some(index) = next_task(queue, cancel) {
                    let exec = TaskExecution {
                        task: tasks[index],
                        scope: CommitScope::Declared,
                        brief: Brief::Task,
                        cancel: Some(cancel),
                        cancel_on_failure: policy == CompletionPolicy::FailFast,
                    };
                    let result = run_task(rt, &exec, None);
                    if result.is_err() && policy == CompletionPolicy::FailFast {
                        cancel.cancel();
                    }
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
                debug!("worker finished");
            });
        }
        drop(tx);
        for (index, result) in rx {
            results[index] = Some(result);
        }
    });

    let mut reports = Vec::with_capacity(tasks.len());
    for (task, result) in tasks.iter().zip(results) {
        match result {
            Some(Ok(report)) => reports.push(report),
            Some(Err(err)) => {
                return Err(err.context(BatchTaskError {
                    task: task.name.clone(),
                }));
            }
            None => {
                rt.events.emit(&Event::TaskCancelled {
                    task: task.name.clone(),
                });
                reports.push(TaskReport::new(task));
            }
        }
    }

    let outcome = BatchOutcome {
        reports,
        cancelled: cancel.is_cancelled(),
    };
    let unfinished = outcome.unfinished().count();
    if unfinished > 0 {
        warn!(unfinished, cancelled = outcome.cancelled, "batch finished with failures");
    } else {
        info!("batch finished");
    }
    Ok(outcome)
}

fn next_task(queue: &Mutex<VecDeque<usize>>, cancel: &CancelToken) -> Option<usize> {
    if cancel.is_cancelled() {
        return None;
    }
    queue.lock().ok()?.pop_front()
}
