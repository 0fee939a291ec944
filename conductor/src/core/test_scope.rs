//! Deterministic choice of the test command for a task's touched files.

use std::collections::BTreeSet;

/// Project markers found at the repository root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectMarkers {
    pub go_mod: bool,
    pub cargo: bool,
    pub python: bool,
    pub node: bool,
}

/// Build the test argv for `files`, or `None` when nothing applies.
///
/// An explicit `template` wins; a `{files}` element expands to the scoped
/// files (and is dropped when there are none).
pub fn plan_test_command(
    markers: ProjectMarkers,
    files: &[String],
    template: Option<&[String]>,
) -> Option<Vec<String>> {
    if let Some(template) = template.filter(|t| !t.is_empty()) {
        let mut argv = Vec::with_capacity(template.len() + files.len());
        for part in template {
            if part == "{files}" {
                argv.extend(files.iter().cloned());
            } else {
                argv.push(part.clone());
            }
        }
        return Some(argv);
    }

    if markers.go_mod {
        let packages = go_packages(files);
        if packages.is_empty() {
            return None;
        }
        let mut argv = vec!["go".to_string(), "test".to_string()];
        argv.extend(packages);
        return Some(argv);
    }
    if markers.cargo {
        return Some(vec!["cargo".to_string(), "test".to_string()]);
    }
    if markers.python {
        let mut argv = vec!["pytest".to_string(), "-q".to_string()];
        argv.extend(files.iter().filter(|f| is_python_test(f)).cloned());
        return Some(argv);
    }
    if markers.node {
        return Some(vec!["npm".to_string(), "test".to_string()]);
    }
    None
}

fn go_packages(files: &[String]) -> Vec<String> {
    let dirs: BTreeSet<String> = files
        .iter()
        .filter(|f| f.ends_with(".go"))
        .map(|f| match f.rsplit_once('/') {
            Some((dir, _)) => format!("./{dir}"),
            None => ".".to_string(),
        })
        .collect();
    dirs.into_iter().collect()
}

fn is_python_test(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
}
