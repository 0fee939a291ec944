//! Review, autofix and replan control after each phase.
//!
//! ```text
//! diff ── empty ──────────────────────────────> Skipped
//!   └─ review ── error ───────────────────────> Skipped (advisory)
//!        ├─ PASS ─────────────────────────────> Proceed
//!        ├─ NEEDS_REPLAN ── restore baseline ─> Replan
//!        └─ NEEDS_ATTENTION
//!             ├─ rounds left: autofix, re-review, loop
//!             │    (a failed re-review ends the rounds, verdict kept)
//!             └─ exhausted: decider ── continue > Proceed (accepted)
//!                                   └─ stop ────> Stop
//! ```
//!
//! The controller never caps replans; the workflow does.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::scope::CommitScope;
use crate::core::types::{ReviewVerdict, Task, TaskCategory, TaskStatus, Verdict};
use crate::core::verdict::parse_review;
use crate::correction::{Brief, TaskExecution, TaskRuntime, run_task};
use crate::events::Event;
use crate::io::backend::{Backend, BackendRequest};
use crate::io::baseline::BaselineDiff;
use crate::io::prompt::{ReviewPrompt, render_review};
use crate::retry::{RetryPolicy, with_retry};

/// Inputs for one review invocation.
#[derive(Debug, Clone)]
pub struct ReviewRequest<'a> {
    pub workdir: PathBuf,
    /// Human label of what is reviewed, e.g. `phase 1 (sequential)`.
    pub label: &'a str,
    pub baseline: &'a str,
    pub diff: &'a BaselineDiff,
    pub tasks: &'a [String],
    pub plan: Option<&'a str>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Produces free-text review output for a diff.
pub trait Reviewer: Send + Sync {
    fn review(&self, request: &ReviewRequest<'_>) -> Result<String>;
}

/// Reviewer that asks the execution backend.
pub struct BackendReviewer<'a> {
    backend: &'a dyn Backend,
    retry: RetryPolicy,
}

impl<'a> BackendReviewer<'a> {
    pub fn new(backend: &'a dyn Backend, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }
}

impl Reviewer for BackendReviewer<'_> {
    #[instrument(skip_all, fields(label = request.label))]
    fn review(&self, request: &ReviewRequest<'_>) -> Result<String> {
        let prompt = render_review(&ReviewPrompt {
            label: request.label,
            baseline: request.baseline,
            tasks: request.tasks,
            plan: request.plan,
            diff: &request.diff.text,
            degraded: request.diff.degraded,
        })?;
        let backend_request = BackendRequest {
            workdir: request.workdir.clone(),
            prompt,
            fresh_session: true,
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
            cancel: None,
        };
        let response = with_retry(self.retry, None, |_| self.backend.execute(&backend_request))?;
        if !response.success() {
            return Err(anyhow!(
                "reviewer exited with status {:?}: {}",
                response.exit_code,
                response.text.lines().next().unwrap_or("")
            ));
        }
        Ok(response.text)
    }
}

/// Explicit operator decision on a persisting NEEDS_ATTENTION verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionDecision {
    Continue,
    Stop,
}

pub trait AttentionDecider: Send + Sync {
    fn decide(&self, label: &str, review: &ReviewVerdict) -> Result<AttentionDecision>;
}

/// Always returns the same decision (non-interactive runs).
#[derive(Debug, Clone, Copy)]
pub struct FixedDecider(pub AttentionDecision);

impl AttentionDecider for FixedDecider {
    fn decide(&self, label: &str, _review: &ReviewVerdict) -> Result<AttentionDecision> {
        info!(label, decision = ?self.0, "attention resolved by configuration");
        Ok(self.0)
    }
}

/// Shows the review on stderr and reads `y`/`n` from stdin. EOF means stop.
#[derive(Debug, Default)]
pub struct StdinDecider;

impl AttentionDecider for StdinDecider {
    fn decide(&self, label: &str, review: &ReviewVerdict) -> Result<AttentionDecision> {
        let stdin = std::io::stdin();
        let stderr = std::io::stderr();
        ask_operator(label, review, &mut stdin.lock(), &mut stderr.lock())
    }
}

fn ask_operator(
    label: &str,
    review: &ReviewVerdict,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<AttentionDecision> {
    writeln!(out, "\nReview of {label} still needs attention:\n")?;
    writeln!(out, "{}", review.raw.trim())?;
    loop {
        write!(out, "\nContinue anyway? [y/N] ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line).context("read decision")? == 0 {
            return Ok(AttentionDecision::Stop);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(AttentionDecision::Continue),
            "" | "n" | "no" => return Ok(AttentionDecision::Stop),
            _ => writeln!(out, "Please answer y or n.")?,
        }
    }
}

/// What the caller must do after a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// No review ran (disabled, nothing to review, or the reviewer failed).
    Skipped { reason: String },
    /// Proceed. `accepted_attention` is set when an operator chose to
    /// continue past NEEDS_ATTENTION.
    Proceed {
        review: ReviewVerdict,
        autofix_rounds: u32,
        accepted_attention: bool,
    },
    /// The operator chose to stop on a persisting NEEDS_ATTENTION.
    Stop {
        review: ReviewVerdict,
        autofix_rounds: u32,
    },
    /// The tree was restored to the baseline; planning must run again.
    Replan { review: ReviewVerdict },
}

impl ReviewOutcome {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            ReviewOutcome::Skipped { .. } => None,
            ReviewOutcome::Proceed { review, .. }
            | ReviewOutcome::Stop { review, .. }
            | ReviewOutcome::Replan { review } => Some(review.verdict),
        }
    }
}

pub struct ReviewController<'a> {
    reviewer: &'a dyn Reviewer,
    decider: &'a dyn AttentionDecider,
    max_autofix_attempts: u32,
    review_timeout: Duration,
    /// Diff text and outcome of the last review that let the run proceed.
    last: Option<(String, ReviewOutcome)>,
}

impl<'a> ReviewController<'a> {
    pub fn new(
        reviewer: &'a dyn Reviewer,
        decider: &'a dyn AttentionDecider,
        max_autofix_attempts: u32,
        review_timeout: Duration,
    ) -> Self {
        Self {
            reviewer,
            decider,
            max_autofix_attempts,
            review_timeout,
            last: None,
        }
    }

    /// Review everything since the runtime's baseline and drive autofix.
    ///
    /// An unchanged diff reuses the previous proceeding outcome.
    #[instrument(skip_all, fields(label = label))]
    pub fn review(
        &mut self,
        rt: &TaskRuntime<'_>,
        label: &str,
        tasks: &[String],
    ) -> Result<ReviewOutcome> {
        let mut diff = rt.guard.diff_since(rt.baseline)?;
        if diff.is_empty() {
            debug!("no changes since baseline; skipping review");
            return Ok(ReviewOutcome::Skipped {
                reason: "no changes since baseline".to_string(),
            });
        }
        if let Some((text, outcome)) = &self.last {
            if *text == diff.text {
                info!("diff unchanged since last review; reusing verdict");
                return Ok(outcome.clone());
            }
        }

        let mut rounds = 0u32;
        let mut autofix_budget = self.max_autofix_attempts;
        let mut review = match self.invoke(rt, label, tasks, &diff, rounds) {
            Some(review) => review,
            None => return Ok(skipped_after_error()),
        };

        let outcome = loop {
            match review.verdict {
                Verdict::Pass => {
                    break ReviewOutcome::Proceed {
                        review,
                        autofix_rounds: rounds,
                        accepted_attention: false,
                    };
                }
                Verdict::NeedsReplan => {
                    warn!("review requested a replan; restoring baseline");
                    rt.guard.restore_to_baseline(rt.baseline)?;
                    return Ok(ReviewOutcome::Replan { review });
                }
                Verdict::NeedsAttention if rounds < autofix_budget => {
                    rounds += 1;
                    self.autofix(rt, label, rounds, &review.raw)?;
                    diff = rt.guard.diff_since(rt.baseline)?;
                    match self.invoke(rt, label, tasks, &diff, rounds) {
                        Some(next) => review = next,
                        None => {
                            // The last parsed verdict still stands and goes to the decider.
                            warn!(rounds, "re-review failed; keeping previous NEEDS_ATTENTION");
                            autofix_budget = rounds;
                        }
                    }
                }
                Verdict::NeedsAttention => {
                    match self.decider.decide(label, &review)? {
                        AttentionDecision::Continue => {
                            warn!(rounds, "continuing past NEEDS_ATTENTION by explicit decision");
                            break ReviewOutcome::Proceed {
                                review,
                                autofix_rounds: rounds,
                                accepted_attention: true,
                            };
                        }
                        AttentionDecision::Stop => {
                            return Ok(ReviewOutcome::Stop {
                                review,
                                autofix_rounds: rounds,
                            });
                        }
                    }
                }
            }
        };

        self.last = Some((diff.text, outcome.clone()));
        Ok(outcome)
    }

    /// Run the reviewer once. `None` means it failed and the failure was logged.
    fn invoke(
        &self,
        rt: &TaskRuntime<'_>,
        label: &str,
        tasks: &[String],
        diff: &BaselineDiff,
        round: u32,
    ) -> Option<ReviewVerdict> {
        let request = ReviewRequest {
            workdir: rt.guard.workdir().to_path_buf(),
            label,
            baseline: &rt.baseline.commit,
            diff,
            tasks,
            plan: rt.plan,
            timeout: self.review_timeout,
            output_limit_bytes: rt.settings.output_limit_bytes,
        };
        let raw = match self.reviewer.review(&request) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(err = %format!("{err:#}"), round, "review failed; continuing without it");
                return None;
            }
        };
        if let Some(log) = rt.run_log {
            if let Err(err) = log.write_review(label, round, &raw) {
                warn!(err = %format!("{err:#}"), "failed to write review log");
            }
        }
        let review = parse_review(&raw);
        info!(verdict = %review.verdict, round, "review completed");
        rt.events.emit(&Event::ReviewCompleted {
            label: label.to_string(),
            verdict: review.verdict,
            round,
        });
        Some(review)
    }

    /// One autofix round: a single fresh-session execution with the review as its error input.
    fn autofix(&self, rt: &TaskRuntime<'_>, label: &str, round: u32, feedback: &str) -> Result<()> {
        let task = Task {
            name: format!("autofix {label} round {round}"),
            description: String::new(),
            category: TaskCategory::Fundamental,
            order: None,
            group: None,
            files: Default::default(),
            status: TaskStatus::Pending,
            line: 0,
        };
        let mut single = *rt;
        single.settings.max_self_corrections = 0;
        let exec = TaskExecution {
            task: &task,
            scope: CommitScope::Whole,
            brief: Brief::Autofix {
                label,
                round,
                feedback,
            },
            cancel: None,
            cancel_on_failure: false,
        };
        let report = run_task(&single, &exec, None)?;
        if report.status() != TaskStatus::Completed {
            warn!(round, "autofix attempt did not complete");
        }
        Ok(())
    }
}

fn skipped_after_error() -> ReviewOutcome {
    ReviewOutcome::Skipped {
        reason: "review invocation failed".to_string(),
    }
}
