//! Task-list document parsing and structural validation.
//!
//! A task is a markdown checkbox bullet followed by optional indented
//! continuation lines. Scheduling metadata lives in HTML comments anywhere in
//! the bullet block:
//!
//! ```text
//! - [ ] Add config loader <!-- category: fundamental, order: 1 -->
//!   Reads `.app/config.toml` and applies defaults.
//!   <!-- files: src/config.go, src/config_test.go -->
//! - [x] Document flags <!-- category: independent; group: docs; files: README.md -->
//! ```
//!
//! This is the only place same-group file overlap is rejected; the parallel
//! executor re-checks whole batches before launching workers.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::scope::{find_scope_conflict, normalize_path};
use crate::core::types::{Task, TaskCategory, TaskStatus};

static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)[-*+]\s+\[([ xX])\]\s+(.*)$").expect("bullet regex should compile")
});
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--(.*?)-->").expect("comment regex should compile"));
static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(category|order|group|files)\s*:").expect("key regex should compile")
});

const DEFAULT_GROUP: &str = "default";

/// Structural defect in a task-list document. Always fatal before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed task list (line {line}): {reason}")]
pub struct MalformedTaskListError {
    /// 1-based line of the offending bullet.
    pub line: usize,
    pub reason: String,
}

/// Parsed, validated task list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskList {
    pub tasks: Vec<Task>,
}

impl TaskList {
    /// FUNDAMENTAL tasks in execution order.
    pub fn fundamental(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|task| task.category == TaskCategory::Fundamental)
            .collect();
        tasks.sort_by_key(|task| task.order);
        tasks
    }

    /// INDEPENDENT tasks in document order.
    pub fn independent(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.category == TaskCategory::Independent)
            .collect()
    }

    /// INDEPENDENT tasks keyed by group.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&Task>> {
        let mut groups: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in self.independent() {
            groups
                .entry(task.group.as_deref().unwrap_or(DEFAULT_GROUP))
                .or_default()
                .push(task);
        }
        groups
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Raw bullet block before annotation parsing.
struct Block {
    line: usize,
    indent: usize,
    checked: bool,
    head: String,
    body: Vec<String>,
}

#[derive(Default)]
struct Annotations {
    category: Option<(String, usize)>,
    order: Option<String>,
    group: Option<String>,
    files: Vec<String>,
    saw_files: bool,
}

/// Parse and validate a task-list document.
pub fn parse_task_list(doc: &str) -> Result<TaskList, MalformedTaskListError> {
    let blocks = split_blocks(doc);
    let mut tasks = Vec::with_capacity(blocks.len());
    for block in &blocks {
        tasks.push(parse_block(block)?);
    }
    validate_tasks(&tasks)?;
    Ok(TaskList { tasks })
}

fn split_blocks(doc: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut open = false;

    for (idx, line) in doc.lines().enumerate() {
        if let Some(caps) = BULLET_RE.captures(line) {
            let indent = caps[1].len();
            let nested = open && blocks.last().is_some_and(|b| indent > b.indent);
            if !nested {
                blocks.push(Block {
                    line: idx + 1,
                    indent,
                    checked: !caps[2].trim().is_empty(),
                    head: caps[3].to_string(),
                    body: Vec::new(),
                });
                open = true;
                continue;
            }
        }

        if !open {
            continue;
        }
        let continues = line.trim().is_empty() || line.starts_with(char::is_whitespace);
        match blocks.last_mut() {
            Some(block) if continues => block.body.push(line.to_string()),
            _ => open = false,
        }
    }

    blocks
}

fn parse_block(block: &Block) -> Result<Task, MalformedTaskListError> {
    let malformed = |reason: String| MalformedTaskListError {
        line: block.line,
        reason,
    };

    let mut annotations = Annotations::default();
    collect_annotations(&block.head, block.line, &mut annotations);
    for (offset, line) in block.body.iter().enumerate() {
        collect_annotations(line, block.line + offset + 1, &mut annotations);
    }

    let name = strip_comments(&block.head).trim().to_string();
    if name.is_empty() {
        return Err(malformed("task bullet has no name".to_string()));
    }
    let description = block
        .body
        .iter()
        .map(|line| strip_comments(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let (raw_category, category_line) = annotations
        .category
        .ok_or_else(|| malformed(format!("task '{name}' is missing a category annotation")))?;
    let category = match raw_category.to_ascii_lowercase().as_str() {
        "fundamental" => TaskCategory::Fundamental,
        "independent" => TaskCategory::Independent,
        other => {
            return Err(MalformedTaskListError {
                line: category_line,
                reason: format!("task '{name}' has unknown category '{other}'"),
            });
        }
    };

    let files: BTreeSet<String> = annotations
        .files
        .iter()
        .map(|raw| normalize_path(raw))
        .filter(|path| !path.is_empty())
        .collect();
    if files.is_empty() {
        let reason = if annotations.saw_files {
            format!("task '{name}' declares an empty files annotation")
        } else {
            format!("task '{name}' is missing a files annotation")
        };
        return Err(malformed(reason));
    }

    let order = match (category, annotations.order) {
        (TaskCategory::Fundamental, None) => {
            return Err(malformed(format!(
                "FUNDAMENTAL task '{name}' is missing an order annotation"
            )));
        }
        (TaskCategory::Fundamental, Some(raw)) => Some(raw.parse::<u32>().map_err(|_| {
            malformed(format!("task '{name}' has non-integer order '{raw}'"))
        })?),
        (TaskCategory::Independent, _) => None,
    };

    let group = match category {
        TaskCategory::Fundamental => None,
        TaskCategory::Independent => Some(
            annotations
                .group
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
        ),
    };

    Ok(Task {
        name,
        description,
        category,
        order,
        group,
        files,
        status: if block.checked {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        },
        line: block.line,
    })
}

fn collect_annotations(line: &str, line_no: usize, out: &mut Annotations) {
    for comment in COMMENT_RE.captures_iter(line) {
        let body = &comment[1];
        let keys: Vec<_> = KEY_RE.captures_iter(body).collect();
        for (i, caps) in keys.iter().enumerate() {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let end = keys
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(body.len(), |m| m.start());
            let value = body[whole.end()..end]
                .trim()
                .trim_end_matches([',', ';'])
                .trim()
                .to_string();
            match key.as_str().to_ascii_lowercase().as_str() {
                "category" => out.category = Some((value, line_no)),
                "order" => out.order = Some(value),
                "group" => out.group = Some(value),
                _ => {
                    out.saw_files = true;
                    out.files.extend(
                        value
                            .split([',', ';'])
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                    );
                }
            }
        }
    }
}

fn strip_comments(line: &str) -> String {
    COMMENT_RE.replace_all(line, "").into_owned()
}

fn validate_tasks(tasks: &[Task]) -> Result<(), MalformedTaskListError> {
    let mut names = HashSet::new();
    for task in tasks {
        if !names.insert(task.name.as_str()) {
            return Err(MalformedTaskListError {
                line: task.line,
                reason: format!("duplicate task name '{}'", task.name),
            });
        }
    }

    let mut orders: BTreeMap<u32, &Task> = BTreeMap::new();
    for task in tasks {
        let Some(order) = task.order else { continue };
        if let Some(existing) = orders.insert(order, task) {
            return Err(MalformedTaskListError {
                line: task.line,
                reason: format!(
                    "order {order} of '{}' collides with '{}' (line {})",
                    task.name, existing.name, existing.line
                ),
            });
        }
    }

    let list = TaskList {
        tasks: tasks.to_vec(),
    };
    for (group, members) in list.groups() {
        if let Some(conflict) = find_scope_conflict(members.iter().copied()) {
            let line = members
                .iter()
                .find(|task| task.name == conflict.second)
                .map_or(0, |task| task.line);
            return Err(MalformedTaskListError {
                line,
                reason: format!(
                    "tasks '{}' and '{}' in group '{group}' declare overlapping files ({} / {})",
                    conflict.first, conflict.second, conflict.first_path, conflict.second_path
                ),
            });
        }
    }

    Ok(())
}
