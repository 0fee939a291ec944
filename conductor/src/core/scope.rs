//! File-scope normalization and overlap checks.
//!
//! Overlap is path-based: two paths overlap when they are equal or one is a
//! directory prefix of the other on a component boundary (`src` overlaps
//! `src/lib.rs`, `src` does not overlap `srcs/lib.rs`).

use std::collections::BTreeSet;

use crate::core::types::Task;

/// Normalize a declared or reported path to a stable comparable form.
///
/// Strips surrounding whitespace/backticks/quotes, converts `\` to `/`,
/// removes leading `./`, empty and `.` components, and trailing `/`.
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
    let unified = trimmed.replace('\\', "/");
    unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// True if `a` and `b` refer to the same path or one contains the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    is_dir_prefix(a, b) || is_dir_prefix(b, a)
}

fn is_dir_prefix(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// True if `path` falls inside any entry of `scope`.
pub fn within_scope(path: &str, scope: &BTreeSet<String>) -> bool {
    scope
        .iter()
        .any(|entry| entry == path || is_dir_prefix(entry, path))
}

/// First overlapping pair of paths between two scopes, if any.
pub fn scopes_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<(String, String)> {
    for left in a {
        for right in b {
            if paths_overlap(left, right) {
                return Some((left.clone(), right.clone()));
            }
        }
    }
    None
}

/// Two tasks whose declared scopes collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConflict {
    pub first: String,
    pub second: String,
    pub first_path: String,
    pub second_path: String,
}

/// Return the first pairwise scope conflict among `tasks`, in document order.
pub fn find_scope_conflict<'a, I>(tasks: I) -> Option<ScopeConflict>
where
    I: IntoIterator<Item = &'a Task>,
{
    let tasks: Vec<&Task> = tasks.into_iter().collect();
    for (i, first) in tasks.iter().enumerate() {
        for second in &tasks[i + 1..] {
            if let Some((first_path, second_path)) = scopes_overlap(&first.files, &second.files) {
                return Some(ScopeConflict {
                    first: first.name.clone(),
                    second: second.name.clone(),
                    first_path,
                    second_path,
                });
            }
        }
    }
    None
}

/// Which changed paths a task's checkpoint may stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitScope {
    /// Sequential phase: the task owns the whole tree.
    Whole,
    /// Parallel phase: only the declared scope belongs to the task.
    Declared,
}

/// Select the changed paths that belong to a task.
///
/// `preexisting` lists paths that were already dirty when the baseline was
/// captured; they are left alone unless the task declared them.
pub fn select_task_paths(
    changed: &[String],
    declared: &BTreeSet<String>,
    preexisting: &[String],
    scope: CommitScope,
) -> Vec<String> {
    let mut selected: Vec<String> = changed
        .iter()
        .filter(|path| match scope {
            CommitScope::Declared => within_scope(path, declared),
            CommitScope::Whole => {
                within_scope(path, declared) || !preexisting.iter().any(|p| p == *path)
            }
        })
        .cloned()
        .collect();
    selected.sort();
    selected.dedup();
    selected
}
