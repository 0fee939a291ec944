//! Per-ticket task memory persisted under `.conductor/memory/<ticket>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::memory::{Learnings, MemoryEntry, rank};
use crate::io::baseline::STATE_DIR;
use crate::io::config::write_atomic;
use crate::io::run_log::slug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    entries: Vec<MemoryEntry>,
}

/// Append-only store of learnings from completed tasks.
#[derive(Debug, Default)]
pub struct TaskMemory {
    path: Option<PathBuf>,
    entries: Vec<MemoryEntry>,
}

impl TaskMemory {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let file: MemoryFile =
                serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
            file.entries
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "loaded task memory");
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// Conventional location of a ticket's store under `root`.
    pub fn path_for(root: &Path, ticket: &str) -> PathBuf {
        root.join(STATE_DIR)
            .join("memory")
            .join(format!("{}.json", slug(ticket)))
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    /// Append an entry for a completed task and persist the store.
    pub fn record_outcome(&mut self, task: &str, learnings: Learnings) -> Result<()> {
        let seq = self.entries.last().map_or(1, |entry| entry.seq + 1);
        self.entries.push(MemoryEntry {
            seq,
            task: task.to_string(),
            learnings,
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        self.persist()
    }

    /// Up to `k` entries ranked by keyword overlap with `description`.
    pub fn retrieve(&self, description: &str, k: usize) -> Vec<MemoryEntry> {
        rank(&self.entries, description, k)
            .into_iter()
            .cloned()
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = MemoryFile {
            entries: self.entries.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize task memory")?;
        buf.push('\n');
        write_atomic(path, &buf)
    }
}
