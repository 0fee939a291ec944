//! Keyword ranking and learning extraction for task memory.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was", "will", "should",
    "add", "use", "new", "all", "any", "each", "when", "then", "not", "but", "its", "our",
];

/// Learnings recorded after a task completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learnings {
    pub patterns: Vec<String>,
    pub decisions: Vec<String>,
    pub test_commands: Vec<String>,
}

impl Learnings {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.decisions.is_empty() && self.test_commands.is_empty()
    }
}

/// One appended memory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Monotonic append sequence; larger is more recent.
    pub seq: u64,
    pub task: String,
    #[serde(flatten)]
    pub learnings: Learnings,
    pub recorded_at: String,
}

impl MemoryEntry {
    fn keywords(&self) -> BTreeSet<String> {
        let mut text = self.task.clone();
        for item in self
            .learnings
            .patterns
            .iter()
            .chain(&self.learnings.decisions)
        {
            text.push(' ');
            text.push_str(item);
        }
        tokenize(&text)
    }
}

/// Lowercased alphanumeric tokens of length >= 3, minus stopwords.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() >= 3 && !STOPWORDS.contains(&token.as_str()))
        .collect()
}

/// Rank entries by keyword overlap with `description`; ties go to the most
/// recent entry. Entries with no overlap are dropped.
pub fn rank<'a>(entries: &'a [MemoryEntry], description: &str, k: usize) -> Vec<&'a MemoryEntry> {
    let wanted = tokenize(description);
    if wanted.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &MemoryEntry)> = entries
        .iter()
        .map(|entry| (entry.keywords().intersection(&wanted).count(), entry))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| b_score.cmp(a_score).then(b.seq.cmp(&a.seq)));
    scored.into_iter().take(k).map(|(_, entry)| entry).collect()
}

/// Pull `PATTERN:`, `DECISION:` and `TEST:` lines out of backend output.
pub fn extract_learnings(output: &str) -> Learnings {
    let mut learnings = Learnings::default();
    for line in output.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match label.trim().to_ascii_uppercase().as_str() {
            "PATTERN" => learnings.patterns.push(value.to_string()),
            "DECISION" => learnings.decisions.push(value.to_string()),
            "TEST" | "TEST COMMAND" => learnings.test_commands.push(value.to_string()),
            _ => {}
        }
    }
    learnings
}
