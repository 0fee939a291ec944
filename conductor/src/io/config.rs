//! Engine configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for the parallel worker pool.
pub const MAX_PARALLEL_LIMIT: usize = 5;

/// A configuration value outside its accepted range. Fatal before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct InvalidConfigError(pub String);

/// What to do when the working tree is dirty at baseline capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirtyTreePolicy {
    FailFast,
    Warn,
}

/// How a persisting NEEDS_ATTENTION verdict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionMode {
    /// Ask the operator on the terminal.
    Prompt,
    Continue,
    Stop,
}

/// Engine configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count for the parallel phase (1..=5).
    pub max_parallel: usize,
    /// Cancel the rest of a parallel batch on the first terminal failure.
    pub fail_fast: bool,
    /// Extra attempts per task after the first; 0 means exactly one attempt.
    pub max_self_corrections: u32,
    /// Autofix rounds on NEEDS_ATTENTION; 0 disables autofix.
    pub max_autofix_attempts: u32,
    pub dirty_tree_policy: DirtyTreePolicy,
    pub review_enabled: bool,
    /// Replan iterations the workflow allows before stopping.
    pub max_replans: u32,
    pub on_attention: AttentionMode,
    pub task_timeout_secs: u64,
    pub review_timeout_secs: u64,
    /// Truncate captured backend/test output beyond this many bytes.
    pub output_limit_bytes: usize,
    pub retry: RetryConfig,
    pub diff: DiffConfig,
    pub backend: BackendConfig,
    pub tests: TestsConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first call on a rate-limit signal; 0 disables retry.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Thresholds past which review diffs degrade to a `--stat` summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiffConfig {
    pub max_lines: usize,
    pub max_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Command spawned per request; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Arguments appended when a request continues an existing session.
    pub continue_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Explicit test command; `{files}` expands to the task's touched files.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub top_k: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_lines: 2_000,
            max_files: 50,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            continue_args: vec!["--continue".to_string()],
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 3,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            fail_fast: true,
            max_self_corrections: 3,
            max_autofix_attempts: 3,
            dirty_tree_policy: DirtyTreePolicy::FailFast,
            review_enabled: true,
            max_replans: 2,
            on_attention: AttentionMode::Prompt,
            task_timeout_secs: 30 * 60,
            review_timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
            retry: RetryConfig::default(),
            diff: DiffConfig::default(),
            backend: BackendConfig::default(),
            tests: TestsConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), InvalidConfigError> {
        validate_parallelism(self.max_parallel)?;
        if self.task_timeout_secs == 0 {
            return Err(InvalidConfigError("task_timeout_secs must be > 0".into()));
        }
        if self.review_timeout_secs == 0 {
            return Err(InvalidConfigError("review_timeout_secs must be > 0".into()));
        }
        if self.output_limit_bytes == 0 {
            return Err(InvalidConfigError("output_limit_bytes must be > 0".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(InvalidConfigError(
                "retry.max_delay_ms must be >= retry.base_delay_ms".into(),
            ));
        }
        if self.diff.max_lines == 0 || self.diff.max_files == 0 {
            return Err(InvalidConfigError(
                "diff.max_lines and diff.max_files must be > 0".into(),
            ));
        }
        if self
            .backend
            .command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(InvalidConfigError(
                "backend.command must be a non-empty array".into(),
            ));
        }
        let empty_tests_command = self
            .tests
            .command
            .as_ref()
            .is_some_and(|command| command.first().is_none_or(|p| p.trim().is_empty()));
        if empty_tests_command {
            return Err(InvalidConfigError(
                "tests.command must be a non-empty array when set".into(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }
}

/// Reject worker counts outside `1..=5`.
pub fn validate_parallelism(n: usize) -> Result<(), InvalidConfigError> {
    if !(1..=MAX_PARALLEL_LIMIT).contains(&n) {
        return Err(InvalidConfigError(format!(
            "max_parallel must be between 1 and {MAX_PARALLEL_LIMIT}, got {n}"
        )));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
