//! Task-list regeneration after a NEEDS_REPLAN verdict.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, instrument};

use crate::io::backend::{Backend, BackendRequest};
use crate::io::prompt::{ReplanPrompt, render_replan};
use crate::retry::{RetryPolicy, with_retry};

#[derive(Debug, Clone)]
pub struct ReplanRequest<'a> {
    /// Raw review text that requested the replan.
    pub feedback: &'a str,
    pub plan: Option<&'a str>,
    /// Task-list document of the iteration being replaced.
    pub task_list: &'a str,
    /// 1-based replan iteration.
    pub iteration: u32,
}

/// Produces a new task-list document.
pub trait Planner: Send + Sync {
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<String>;
}

/// Planner that asks the execution backend for a revised checklist.
pub struct BackendPlanner<'a> {
    backend: &'a dyn Backend,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    retry: RetryPolicy,
}

impl<'a> BackendPlanner<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
            retry,
        }
    }
}

impl Planner for BackendPlanner<'_> {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<String> {
        let prompt = render_replan(&ReplanPrompt {
            feedback: request.feedback,
            plan: request.plan,
            task_list: request.task_list,
        })?;
        let backend_request = BackendRequest {
            workdir: self.workdir.clone(),
            prompt,
            fresh_session: true,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
            cancel: None,
        };
        let response = with_retry(self.retry, None, |_| self.backend.execute(&backend_request))?;
        if !response.success() {
            bail!(
                "planner exited with status {:?}: {}",
                response.exit_code,
                response.text.trim()
            );
        }
        let document = strip_fences(&response.text);
        if document.trim().is_empty() {
            bail!("planner returned an empty task list");
        }
        info!(bytes = document.len(), "received revised task list");
        Ok(document)
    }
}

/// Drop markdown code-fence lines around a reply.
fn strip_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
