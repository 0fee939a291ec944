//! Git baseline guard: anchors every diff and restore of a run to one commit.
//!
//! Reads (`status`, `diff`) may run from any worker at any time. The two
//! mutating operations, checkpoint commits and restores, are serialized by a
//! single mutex so at most one of them touches the index at once.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::config::{DiffConfig, DirtyTreePolicy};
use crate::io::git::Git;

/// Directory holding engine state inside the repository.
pub const STATE_DIR: &str = ".conductor";

/// The working tree had uncommitted changes under the `fail-fast` policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("working tree is dirty ({} paths, first: {}); commit or stash first, or use the warn policy", .paths.len(), .paths.first().map_or("-", String::as_str))]
pub struct DirtyTreeError {
    pub paths: Vec<String>,
}

/// Commit all diffs and restores of one run (or replan iteration) are anchored to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub commit: String,
    /// Paths already dirty at capture time (only under the warn policy).
    pub dirty_paths: Vec<String>,
    /// Contents of `dirty_paths` at capture, put back after a restore.
    #[serde(skip)]
    pub preserved: Vec<PreservedPath>,
}

impl Baseline {
    /// A clean baseline at `commit`.
    pub fn at(commit: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            ..Self::default()
        }
    }
}

/// One pre-run change: file contents, or `None` when the path was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedPath {
    pub path: String,
    pub contents: Option<Vec<u8>>,
}

/// Diff of the working tree against a baseline, possibly degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineDiff {
    /// Full unified diff, or the stat summary when degraded.
    pub text: String,
    pub stat: String,
    pub files_changed: usize,
    pub lines_changed: u64,
    /// The changeset exceeded a threshold and `text` holds only the summary.
    pub degraded: bool,
}

impl BaselineDiff {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

/// Result of a checkpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Committed(String),
    /// None of the selected paths had changes.
    NothingToCommit,
    /// The batch was cancelled before the commit lock was acquired.
    Cancelled,
}

pub struct BaselineGuard {
    git: Git,
    policy: DirtyTreePolicy,
    limits: DiffConfig,
    lock: Mutex<()>,
}

impl BaselineGuard {
    pub fn new(workdir: impl Into<PathBuf>, policy: DirtyTreePolicy, limits: DiffConfig) -> Self {
        Self {
            git: Git::new(workdir),
            policy,
            limits,
            lock: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        self.git.workdir()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn head(&self) -> Result<String> {
        self.git.head()
    }

    /// Record HEAD as the baseline after applying the dirty-tree policy.
    #[instrument(skip_all, fields(policy = ?self.policy))]
    pub fn capture_baseline(&self) -> Result<Baseline> {
        ensure_state_ignored(self.workdir())?;
        let commit = self.git.head()?;
        let dirty_paths = self.git.changed_paths()?;
        if !dirty_paths.is_empty() {
            match self.policy {
                DirtyTreePolicy::FailFast => {
                    return Err(DirtyTreeError { paths: dirty_paths }.into());
                }
                DirtyTreePolicy::Warn => {
                    warn!(
                        dirty_count = dirty_paths.len(),
                        "working tree is dirty; continuing under warn policy"
                    );
                }
            }
        }
        let preserved = self.snapshot(&dirty_paths)?;
        info!(baseline = %commit, "captured baseline");
        Ok(Baseline {
            commit,
            dirty_paths,
            preserved,
        })
    }

    fn snapshot(&self, paths: &[String]) -> Result<Vec<PreservedPath>> {
        paths
            .iter()
            .map(|path| {
                let full = self.workdir().join(path);
                let contents = match fs::read(&full) {
                    Ok(bytes) => Some(bytes),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                    Err(err) => {
                        return Err(err).with_context(|| format!("snapshot {}", full.display()));
                    }
                };
                Ok(PreservedPath {
                    path: path.clone(),
                    contents,
                })
            })
            .collect()
    }

    /// Diff the working tree against `baseline`, degrading large changesets to `--stat`.
    #[instrument(skip_all, fields(baseline = %baseline.commit))]
    pub fn diff_since(&self, baseline: &Baseline) -> Result<BaselineDiff> {
        let numstat = self.git.diff_numstat_against(&baseline.commit)?;
        let untracked: Vec<String> = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.is_untracked() && !baseline.dirty_paths.contains(&entry.path))
            .map(|entry| entry.path)
            .collect();

        let files_changed = numstat.len() + untracked.len();
        let lines_changed: u64 = numstat
            .iter()
            .map(|e| e.added.unwrap_or(0) + e.removed.unwrap_or(0))
            .sum();

        let mut stat = self.git.diff_stat_against(&baseline.commit)?;
        for path in &untracked {
            stat.push_str(&format!(" {path} (untracked)\n"));
        }

        let degraded = files_changed > self.limits.max_files
            || lines_changed > self.limits.max_lines as u64;
        let text = if degraded {
            debug!(files_changed, lines_changed, "diff exceeds limits; using stat summary");
            format!(
                "[diff degraded to summary: {files_changed} files, {lines_changed} lines changed]\n{stat}"
            )
        } else {
            let mut text = self.git.diff_against(&baseline.commit)?;
            if !untracked.is_empty() {
                text.push_str("\n# untracked files not shown above:\n");
                for path in &untracked {
                    text.push_str(&format!("#   {path}\n"));
                }
            }
            text
        };

        Ok(BaselineDiff {
            text,
            stat,
            files_changed,
            lines_changed,
            degraded,
        })
    }

    /// Make the working tree equal the baseline exactly (ignored files survive).
    ///
    /// Changes that predated the run are written back after the reset, so the
    /// tree ends up as it was at capture rather than at `baseline.commit`.
    #[instrument(skip_all, fields(baseline = %baseline.commit))]
    pub fn restore_to_baseline(&self, baseline: &Baseline) -> Result<()> {
        let _guard = self.lock()?;
        self.git.reset_hard(&baseline.commit)?;
        self.git.clean_untracked()?;
        for entry in &baseline.preserved {
            let full = self.workdir().join(&entry.path);
            match &entry.contents {
                Some(bytes) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create {}", parent.display()))?;
                    }
                    fs::write(&full, bytes)
                        .with_context(|| format!("re-apply {}", full.display()))?;
                }
                None if full.exists() => {
                    fs::remove_file(&full)
                        .with_context(|| format!("re-delete {}", full.display()))?;
                }
                None => {}
            }
        }
        if !baseline.preserved.is_empty() {
            info!(
                preserved = baseline.preserved.len(),
                "re-applied changes that predate the run"
            );
        }
        info!("working tree restored to baseline");
        Ok(())
    }

    /// Commit `paths` as one task's checkpoint.
    ///
    /// The cancellation check happens under the lock: once a sibling has
    /// cancelled the batch, no further checkpoint can land.
    #[instrument(skip_all, fields(path_count = paths.len()))]
    pub fn commit_checkpoint(
        &self,
        message: &str,
        paths: &[String],
        cancel: Option<&CancelToken>,
    ) -> Result<CheckpointOutcome> {
        let _guard = self.lock()?;
        if cancel.is_some_and(CancelToken::is_cancelled) {
            debug!("batch cancelled; skipping checkpoint");
            return Ok(CheckpointOutcome::Cancelled);
        }
        if paths.is_empty() {
            return Ok(CheckpointOutcome::NothingToCommit);
        }
        self.git.add_paths(paths)?;
        match self.git.commit_staged(message)? {
            Some(sha) => {
                info!(checkpoint = %sha, "checkpoint committed");
                Ok(CheckpointOutcome::Committed(sha))
            }
            None => Ok(CheckpointOutcome::NothingToCommit),
        }
    }

    /// Throw away uncommitted changes to `paths` (back to HEAD).
    #[instrument(skip_all, fields(path_count = paths.len()))]
    pub fn restore_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let _guard = self.lock()?;
        self.git.unstage_paths(paths)?;
        let (untracked, tracked): (Vec<_>, Vec<_>) = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| paths.contains(&entry.path))
            .partition(|entry| entry.is_untracked());
        let tracked: Vec<String> = tracked.into_iter().map(|e| e.path).collect();
        let untracked: Vec<String> = untracked.into_iter().map(|e| e.path).collect();
        self.git.checkout_head_paths(&tracked)?;
        self.git.clean_paths(&untracked)?;
        debug!(
            tracked = tracked.len(),
            untracked = untracked.len(),
            "restored task paths"
        );
        Ok(())
    }

    /// Currently changed paths (tracked and untracked), for attributing work to a task.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        self.git.changed_paths()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("baseline guard lock poisoned"))
    }
}

/// Create `.conductor/.gitignore` so engine artifacts never dirty the tree.
pub fn ensure_state_ignored(workdir: &Path) -> Result<()> {
    let dir = workdir.join(STATE_DIR);
    let ignore = dir.join(".gitignore");
    if ignore.exists() {
        return Ok(());
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
    Ok(())
}
