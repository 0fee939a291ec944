//! Prompt rendering for backend calls.
//!
//! Templates live next to this file and are compiled in. The engine only fills
//! their slots; wording changes never touch orchestration code.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::memory::MemoryEntry;
use crate::core::types::Task;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const AUTOFIX_TEMPLATE: &str = include_str!("prompts/autofix.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("autofix", AUTOFIX_TEMPLATE)
            .expect("autofix template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        env.add_template("replan", REPLAN_TEMPLATE)
            .expect("replan template should be valid");
        Self { env }
    }
}

/// Slots for a task execution prompt.
#[derive(Debug, Clone)]
pub struct TaskPrompt<'a> {
    pub task: &'a Task,
    pub plan: Option<&'a str>,
    /// Index of the attempt that produced `prior_error`.
    pub attempt: u32,
    pub prior_error: Option<&'a str>,
    pub memory: &'a [MemoryEntry],
}

pub fn render_task(input: &TaskPrompt<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("task")?;
    let rendered = template.render(context! {
        task => input.task,
        plan => non_empty(input.plan),
        attempt => input.attempt,
        prior_error => non_empty(input.prior_error),
        memory => input.memory,
    })?;
    Ok(tidy(&rendered))
}

/// Slots for an autofix prompt (review feedback stands in for the prior error).
#[derive(Debug, Clone)]
pub struct AutofixPrompt<'a> {
    pub label: &'a str,
    pub round: u32,
    pub feedback: &'a str,
    pub stat: Option<&'a str>,
}

pub fn render_autofix(input: &AutofixPrompt<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("autofix")?;
    let rendered = template.render(context! {
        label => input.label,
        round => input.round,
        feedback => input.feedback.trim(),
        stat => non_empty(input.stat),
    })?;
    Ok(tidy(&rendered))
}

#[derive(Debug, Clone)]
pub struct ReviewPrompt<'a> {
    pub label: &'a str,
    pub baseline: &'a str,
    pub tasks: &'a [String],
    pub plan: Option<&'a str>,
    pub diff: &'a str,
    pub degraded: bool,
}

pub fn render_review(input: &ReviewPrompt<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("review")?;
    let rendered = template.render(context! {
        label => input.label,
        baseline => input.baseline,
        tasks => input.tasks,
        plan => non_empty(input.plan),
        diff => input.diff.trim_end(),
        degraded => input.degraded,
    })?;
    Ok(tidy(&rendered))
}

#[derive(Debug, Clone)]
pub struct ReplanPrompt<'a> {
    pub feedback: &'a str,
    pub plan: Option<&'a str>,
    pub task_list: &'a str,
}

pub fn render_replan(input: &ReplanPrompt<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("replan")?;
    let rendered = template.render(context! {
        feedback => input.feedback.trim(),
        plan => non_empty(input.plan),
        task_list => input.task_list.trim(),
    })?;
    Ok(tidy(&rendered))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Collapse runs of blank lines left behind by skipped template blocks.
fn tidy(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut blank_run = 0;
    for line in rendered.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim().to_string() + "\n"
}
