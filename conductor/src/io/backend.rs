//! Backend abstraction for AI execution.
//!
//! The [`Backend`] trait decouples orchestration from the process that turns a
//! prompt into repository edits. Tests use scripted backends that return
//! predetermined output without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::process::run_command;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|too many requests|\b429\b|overloaded")
        .expect("rate limit regex should compile")
});

/// Parameters for one backend call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    /// Start with no conversation state from earlier calls.
    pub fresh_session: bool,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelToken>,
}

/// Raw result of a backend call that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub text: String,
    pub exit_code: Option<i32>,
}

impl BackendResponse {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Backend failures that callers classify with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Transient; eligible for retry with backoff.
    #[error("backend rate limited: {0}")]
    RateLimited(String),
    #[error("backend timed out after {0:?}")]
    TimedOut(Duration),
    #[error("backend call cancelled")]
    Cancelled,
    #[error("failed to start backend: {0}")]
    Spawn(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::RateLimited(_))
    }
}

/// Abstraction over AI execution backends.
pub trait Backend: Send + Sync {
    /// Run one prompt to completion.
    ///
    /// A response with a non-zero exit code is returned as `Ok`; only
    /// infrastructure faults (rate limit, timeout, cancellation, spawn) are errors.
    fn execute(&self, request: &BackendRequest) -> Result<BackendResponse>;
}

/// Backend that spawns a configured command per call with the prompt on stdin.
///
/// Every call is a separate process, so every call is a fresh session unless
/// `continue_args` ask the tool to resume its last one.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: Vec<String>,
    continue_args: Vec<String>,
}

impl CommandBackend {
    pub fn new(command: Vec<String>, continue_args: Vec<String>) -> Self {
        Self {
            command,
            continue_args,
        }
    }

    fn build_command(&self, request: &BackendRequest) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| BackendError::Spawn("backend command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if !request.fresh_session {
            cmd.args(&self.continue_args);
        }
        cmd.current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Backend for CommandBackend {
    #[instrument(skip_all, fields(fresh = request.fresh_session, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &BackendRequest) -> Result<BackendResponse> {
        info!(workdir = %request.workdir.display(), "invoking backend");
        let cmd = self.build_command(request)?;
        let output = match run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.cancel.as_ref(),
        ) {
            Ok(output) => output,
            Err(err) => {
                let program = self.command.first().map_or("", String::as_str);
                return Err(anyhow::Error::new(BackendError::Spawn(format!("{err:#}")))
                    .context(format!("run backend '{program}'")));
            }
        };

        if output.cancelled {
            return Err(BackendError::Cancelled.into());
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "backend timed out");
            return Err(BackendError::TimedOut(request.timeout).into());
        }

        let text = output.combined_text("backend");
        let exit_code = output.status.code();
        if !output.status.success() {
            if let Some(signal) = rate_limit_signal(&text) {
                warn!(exit_code = ?exit_code, "backend reported rate limiting");
                return Err(BackendError::RateLimited(signal).into());
            }
            warn!(exit_code = ?exit_code, "backend exited unsuccessfully");
        } else {
            debug!("backend completed");
        }
        Ok(BackendResponse { text, exit_code })
    }
}

/// The line of `text` that signals rate limiting, if any.
pub fn rate_limit_signal(text: &str) -> Option<String> {
    text.lines()
        .find(|line| RATE_LIMIT_RE.is_match(line))
        .map(|line| line.trim().to_string())
}

/// True if `err` (anywhere in its chain) is a retryable backend error.
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<BackendError>()
            .is_some_and(BackendError::is_retryable)
    })
}

/// True if `err` is a cancellation rather than a failure.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<BackendError>(), Some(BackendError::Cancelled)))
}
