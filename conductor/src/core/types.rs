//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between core components and the
//! orchestration layer. They carry no I/O and serialize deterministically.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduling category declared for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    /// Runs sequentially in phase 1, ordered by `order`.
    Fundamental,
    /// Runs concurrently in phase 2 with file-disjoint siblings.
    Independent,
}

impl TaskCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskCategory::Fundamental => "FUNDAMENTAL",
            TaskCategory::Independent => "INDEPENDENT",
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A parsed task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity (the bullet text with annotations stripped).
    pub name: String,
    /// Free-form continuation text under the bullet.
    pub description: String,
    pub category: TaskCategory,
    /// Execution order; only set for FUNDAMENTAL tasks.
    pub order: Option<u32>,
    /// Group tag; only set for INDEPENDENT tasks.
    pub group: Option<String>,
    /// Declared file scope (normalized paths).
    pub files: BTreeSet<String>,
    pub status: TaskStatus,
    /// 1-based line of the bullet in the task-list document.
    pub line: usize,
}

impl Task {
    /// Name plus description, used for memory ranking and prompts.
    pub fn summary_text(&self) -> String {
        if self.description.is_empty() {
            return self.name.clone();
        }
        format!("{}\n{}", self.name, self.description)
    }
}

/// Terminal outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Immutable record of one execution attempt (index 0 = original).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub index: u32,
    pub outcome: AttemptOutcome,
    /// Backend text captured for this attempt.
    pub output: String,
    /// Diagnostic payload that made this attempt fail (fed to the next one).
    pub error: Option<String>,
    /// Files the attempt changed, relative to the repository root.
    pub changed_files: Vec<String>,
}

/// Per-task result assembled by the self-correction loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub category: TaskCategory,
    pub attempts: Vec<Attempt>,
    /// Checkpoint commit recording the accepted changes.
    pub checkpoint: Option<String>,
    /// Execution reported success without touching the working tree.
    pub no_changes: bool,
}

impl TaskReport {
    pub fn new(task: &Task) -> Self {
        Self {
            task: task.name.clone(),
            category: task.category,
            attempts: Vec::new(),
            checkpoint: None,
            no_changes: false,
        }
    }

    /// Status derived from the most recent attempt.
    pub fn status(&self) -> TaskStatus {
        match self.attempts.last().map(|attempt| attempt.outcome) {
            None => TaskStatus::Pending,
            Some(AttemptOutcome::Succeeded) => TaskStatus::Completed,
            Some(AttemptOutcome::Failed | AttemptOutcome::Cancelled) => TaskStatus::Failed,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|attempt| attempt.outcome == AttemptOutcome::Cancelled)
    }

    /// Error text of the latest failed attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.error.as_deref())
    }
}

/// Classification parsed from free-text review output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    NeedsAttention,
    NeedsReplan,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::NeedsAttention => "NEEDS_ATTENTION",
            Verdict::NeedsReplan => "NEEDS_REPLAN",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed verdict plus the raw review text for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    pub raw: String,
}

/// Execution phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Phase 1: FUNDAMENTAL tasks, strictly sequential.
    Sequential,
    /// Phase 2: INDEPENDENT tasks, bounded worker pool.
    Parallel,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sequential => f.write_str("phase 1 (sequential)"),
            Phase::Parallel => f.write_str("phase 2 (parallel)"),
        }
    }
}
