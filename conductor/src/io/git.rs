//! Git adapter for the execution engine.
//!
//! The engine depends only on a handful of porcelain commands (`status`,
//! `diff`, `reset --hard`, `clean`, `checkout`, `add`, `commit`, `rev-parse`),
//! so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Per-file line counts from `git diff --numstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumstatEntry {
    /// `None` for binary files.
    pub added: Option<u64>,
    pub removed: Option<u64>,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the full commit id of HEAD.
    pub fn head(&self) -> Result<String> {
        let out = self
            .run_capture(&["rev-parse", "--verify", "HEAD"])
            .context("resolve HEAD (repository needs at least one commit)")?;
        Ok(out.trim().to_string())
    }

    /// Resolve `rev` to a full commit id.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let target = format!("{rev}^{{commit}}");
        let out = self
            .run_capture(&["rev-parse", "--verify", "--quiet", &target])
            .with_context(|| format!("resolve {rev}"))?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths with uncommitted changes (tracked or untracked).
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    /// Stage additions, modifications and deletions under `paths` only.
    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(None) and does nothing;
    /// otherwise returns the new commit id.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<Option<String>> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(None);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        self.head().map(Some)
    }

    /// Unified diff of the working tree against `rev`.
    pub fn diff_against(&self, rev: &str) -> Result<String> {
        self.run_capture(&["diff", "--no-color", rev])
    }

    /// `--stat` summary of the working tree against `rev`.
    pub fn diff_stat_against(&self, rev: &str) -> Result<String> {
        self.run_capture(&["diff", "--no-color", "--stat", rev])
    }

    /// Per-file line counts of the working tree against `rev`.
    pub fn diff_numstat_against(&self, rev: &str) -> Result<Vec<NumstatEntry>> {
        let out = self.run_capture(&["diff", "--numstat", rev])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_numstat_line)
            .collect()
    }

    /// Paths changed between two commits.
    pub fn diff_names(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", from, to])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Hard reset tracked files and the index to `rev`.
    #[instrument(skip_all, fields(rev = rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        debug!(rev, "hard reset");
        self.run_checked(&["reset", "--hard", "--quiet", rev])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-f", "-d", "--quiet"])?;
        Ok(())
    }

    /// Remove specific untracked paths.
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["clean", "-f", "-d", "--quiet", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Drop `paths` from the index without touching the worktree.
    pub fn unstage_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["reset", "--quiet", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Restore tracked `paths` (index and worktree) to their HEAD contents.
    pub fn checkout_head_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["checkout", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        // Reads must not take the index lock a concurrent checkpoint commit needs.
        Command::new("git")
            .arg("--no-optional-locks")
            .arg("-c")
            .arg("core.quotepath=false")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

fn parse_numstat_line(line: &str) -> Result<NumstatEntry> {
    let mut parts = line.splitn(3, '\t');
    let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("unexpected numstat line: '{line}'"));
    };
    Ok(NumstatEntry {
        added: added.parse().ok(),
        removed: removed.parse().ok(),
        path: path.trim().to_string(),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
