//! Run artifacts under `.conductor/runs/<ticket>/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::io::baseline::STATE_DIR;

/// Directory for one run's summary and attempt logs.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(root: &Path, ticket: &str, run_id: &str) -> Self {
        Self {
            dir: root
                .join(STATE_DIR)
                .join("runs")
                .join(slug(ticket))
                .join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.json")
    }

    /// Write the captured output of one execution attempt.
    pub fn write_attempt(&self, task: &str, index: u32, contents: &str) -> Result<PathBuf> {
        let path = self
            .dir
            .join("attempts")
            .join(slug(task))
            .join(format!("{index}.log"));
        write_text(&path, contents)?;
        Ok(path)
    }

    /// Write raw review output for one review round.
    pub fn write_review(&self, label: &str, round: u32, contents: &str) -> Result<PathBuf> {
        let path = self
            .dir
            .join("reviews")
            .join(format!("{}-{round}.md", slug(label)));
        write_text(&path, contents)?;
        Ok(path)
    }

    /// Keep the task list a replan produced for `iteration`.
    pub fn write_task_list(&self, iteration: u32, document: &str) -> Result<PathBuf> {
        let path = self.dir.join(format!("tasks-{iteration}.md"));
        write_text(&path, document)?;
        Ok(path)
    }

    pub fn write_summary<T: Serialize>(&self, summary: &T) -> Result<PathBuf> {
        let path = self.summary_path();
        let mut payload = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        payload.push('\n');
        write_text(&path, &payload)?;
        Ok(path)
    }
}

/// Sortable run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let mut rng = rand::thread_rng();
    let short_id = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{}_{short_id}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Filesystem-safe lowercase slug (`[a-z0-9-]`, collapsed dashes).
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        return "untitled".to_string();
    }
    trimmed.chars().take(80).collect()
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
