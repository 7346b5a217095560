//! Markdown task-file parsing and views.
//!
//! The task file is the canonical mutable state of a run: a hierarchical
//! checklist of `- [ ]` / `- [x]` items nested by 2-space indentation.
//! Non-checklist lines (headings, prose, blanks) pass through mutations
//! untouched.
//!
//! A task is *runnable* iff it is unchecked and all of its children are
//! checked; leaves are always runnable while unchecked. Task identity is a
//! [`TaskKey`] derived from position and text, stable across checkbox flips
//! and sub-task insertion.

mod mutate;

pub use mutate::{auto_complete_ancestors, insert_subtasks, mark_checked};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loopdetect::hash::sha256_hex;

/// Stable identity of a task: ordinal path plus a short text hash.
///
/// The path component (`"2.1"`) distinguishes identical text under
/// different parents; the hash component pins the key to the task text so a
/// reworded task is a new task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey(String);

impl TaskKey {
    fn derive(path: &[usize], text: &str) -> Self {
        let ordinals: Vec<String> = path.iter().map(ToString::to_string).collect();
        let digest = sha256_hex(text.trim().as_bytes());
        Self(format!("{}:{}", ordinals.join("."), &digest[..8]))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One checklist item.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identity.
    pub key: TaskKey,
    /// Item text, trimmed.
    pub text: String,
    /// Nesting depth, 0 for top-level items.
    pub depth: usize,
    /// Whether the checkbox is ticked.
    pub checked: bool,
    /// Parent key, if nested.
    pub parent: Option<TaskKey>,
    /// Child keys in file order.
    pub children: Vec<TaskKey>,
    /// Index into the raw line list, for mutation.
    pub(crate) line: usize,
}

impl Task {
    /// Whether this task is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A raw line of the file: either a parsed checklist item or opaque text.
#[derive(Debug, Clone)]
pub(crate) enum Line {
    /// Checklist item; indices into [`TaskFile::tasks`] are rebuilt on
    /// parse.
    Item {
        /// Leading whitespace, preserved verbatim.
        indent: String,
        /// Checkbox state.
        checked: bool,
        /// Item text.
        text: String,
    },
    /// Any non-checklist line, passed through verbatim.
    Other(String),
}

/// A parsed task file: ordered tasks plus the raw lines they came from.
#[derive(Debug, Clone)]
pub struct TaskFile {
    path: PathBuf,
    pub(crate) lines: Vec<Line>,
    tasks: Vec<Task>,
    index: HashMap<TaskKey, usize>,
}

impl TaskFile {
    /// Parse a task file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskFileInvalid`] when the checklist structure is
    /// unreadable (an item nested more than one level below its
    /// predecessor), or [`Error::Io`] when the file cannot be read.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(path, &content)
    }

    /// Parse task-file content that has already been read.
    pub fn parse_str(path: impl AsRef<Path>, content: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut lines = Vec::new();
        for raw in content.lines() {
            lines.push(parse_line(raw));
        }
        let tasks = build_tasks(&path, &lines)?;
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.clone(), i))
            .collect();
        Ok(Self {
            path,
            lines,
            tasks,
            index,
        })
    }

    /// Path this file was parsed from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All tasks in file order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a task by key.
    #[must_use]
    pub fn task(&self, key: &TaskKey) -> Option<&Task> {
        self.index.get(key).map(|&i| &self.tasks[i])
    }

    /// Unchecked tasks in file order.
    #[must_use]
    pub fn pending(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| !t.checked).collect()
    }

    /// Checked tasks in file order.
    #[must_use]
    pub fn completed(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.checked).collect()
    }

    /// Unchecked runnable tasks in file order, minus the skipped set.
    ///
    /// A parent whose children are not all checked is not runnable, so a
    /// parent is never returned ahead of an unchecked child.
    #[must_use]
    pub fn runnable_pending(&self, skipped: &HashSet<TaskKey>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !t.checked && !skipped.contains(&t.key))
            .filter(|t| {
                t.children
                    .iter()
                    .all(|c| self.task(c).is_some_and(|child| child.checked))
            })
            .collect()
    }

    /// Every ancestor of `key`, nearest first.
    #[must_use]
    pub fn ancestors(&self, key: &TaskKey) -> Vec<&Task> {
        let mut out = Vec::new();
        let mut current = self.task(key).and_then(|t| t.parent.as_ref());
        while let Some(parent_key) = current {
            let Some(parent) = self.task(parent_key) else {
                break;
            };
            out.push(parent);
            current = parent.parent.as_ref();
        }
        out
    }

    /// Whether every descendant of `key` is checked.
    #[must_use]
    pub fn descendants_checked(&self, key: &TaskKey) -> bool {
        let Some(task) = self.task(key) else {
            return false;
        };
        task.children.iter().all(|c| {
            self.task(c)
                .is_some_and(|child| child.checked && self.descendants_checked(&child.key))
        })
    }

    /// Render the file back to its textual form.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Item {
                    indent,
                    checked,
                    text,
                } => {
                    out.push_str(indent);
                    out.push_str(if *checked { "- [x] " } else { "- [ ] " });
                    out.push_str(text);
                }
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim_start();
    let indent_len = raw.len() - trimmed.len();
    for marker in ["- [ ] ", "- [x] ", "- [X] "] {
        if let Some(text) = trimmed.strip_prefix(marker) {
            return Line::Item {
                indent: raw[..indent_len].to_string(),
                checked: marker != "- [ ] ",
                text: text.trim_end().to_string(),
            };
        }
    }
    // A checkbox with no trailing text is still an item.
    for marker in ["- [ ]", "- [x]", "- [X]"] {
        if trimmed == marker {
            return Line::Item {
                indent: raw[..indent_len].to_string(),
                checked: marker != "- [ ]",
                text: String::new(),
            };
        }
    }
    Line::Other(raw.to_string())
}

/// Indentation depth in 2-space steps; a tab counts as one step.
fn indent_depth(indent: &str) -> usize {
    let mut units = 0usize;
    for ch in indent.chars() {
        match ch {
            '\t' => units += 2,
            _ => units += 1,
        }
    }
    units / 2
}

fn build_tasks(path: &Path, lines: &[Line]) -> Result<Vec<Task>> {
    let mut tasks: Vec<Task> = Vec::new();
    // Open ancestors: stack[d] is the task index of the current parent at
    // depth d. counters[d] numbers siblings at depth d.
    let mut stack: Vec<usize> = Vec::new();
    let mut counters: Vec<usize> = Vec::new();

    for (line_no, line) in lines.iter().enumerate() {
        let Line::Item {
            indent,
            checked,
            text,
        } = line
        else {
            continue;
        };
        let depth = indent_depth(indent);

        if depth > stack.len() {
            return Err(Error::TaskFileInvalid {
                path: path.to_path_buf(),
                detail: format!(
                    "line {}: item nested at depth {depth} with no parent at depth {}",
                    line_no + 1,
                    depth.saturating_sub(1)
                ),
            });
        }
        stack.truncate(depth);
        counters.truncate(depth + 1);
        if counters.len() < depth + 1 {
            counters.resize(depth + 1, 0);
        }
        counters[depth] += 1;

        let key = TaskKey::derive(&counters[..=depth], text);
        let parent = stack.last().map(|&idx| tasks[idx].key.clone());

        let task_idx = tasks.len();
        if let Some(&parent_idx) = stack.last() {
            tasks[parent_idx].children.push(key.clone());
        }
        tasks.push(Task {
            key,
            text: text.clone(),
            depth,
            checked: *checked,
            parent,
            children: Vec::new(),
            line: line_no,
        });
        stack.push(task_idx);
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Tasks

- [ ] Build the parser
  - [x] Tokenize input
  - [ ] Emit AST
- [x] Write docs
- [ ] Ship it
";

    fn parse(content: &str) -> TaskFile {
        TaskFile::parse_str("/tmp/tasks.md", content).unwrap()
    }

    #[test]
    fn parses_structure_and_checkboxes() {
        let file = parse(SAMPLE);
        let tasks = file.tasks();
        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].text, "Build the parser");
        assert_eq!(tasks[0].depth, 0);
        assert_eq!(tasks[0].children.len(), 2);
        assert!(tasks[1].checked);
        assert_eq!(tasks[1].depth, 1);
        assert_eq!(tasks[1].parent, Some(tasks[0].key.clone()));
        assert!(!tasks[4].checked);
    }

    #[test]
    fn non_checklist_lines_survive_rendering() {
        let file = parse(SAMPLE);
        let rendered = file.render();
        assert!(rendered.starts_with("# Tasks\n"));
        assert_eq!(parse(&rendered).render(), rendered);
    }

    #[test]
    fn parse_round_trips() {
        let file = parse(SAMPLE);
        let reparsed = parse(&file.render());
        let keys: Vec<_> = file.tasks().iter().map(|t| t.key.clone()).collect();
        let keys2: Vec<_> = reparsed.tasks().iter().map(|t| t.key.clone()).collect();
        assert_eq!(keys, keys2);
    }

    #[test]
    fn rejects_orphaned_nesting() {
        let err = TaskFile::parse_str("/tmp/t.md", "    - [ ] floating child\n").unwrap_err();
        assert!(matches!(err, Error::TaskFileInvalid { .. }));
    }

    #[test]
    fn same_text_different_parents_gets_distinct_keys() {
        let content = "\
- [ ] Module A
  - [ ] add tests
- [ ] Module B
  - [ ] add tests
";
        let file = parse(content);
        let tasks = file.tasks();
        assert_eq!(tasks[1].text, tasks[3].text);
        assert_ne!(tasks[1].key, tasks[3].key);
    }

    #[test]
    fn runnable_excludes_parents_with_unchecked_children() {
        let file = parse(SAMPLE);
        let runnable = file.runnable_pending(&HashSet::new());
        let texts: Vec<_> = runnable.iter().map(|t| t.text.as_str()).collect();
        // "Build the parser" has an unchecked child, so "Emit AST" comes
        // first.
        assert_eq!(texts, vec!["Emit AST", "Ship it"]);
    }

    #[test]
    fn runnable_honors_the_skip_set() {
        let file = parse(SAMPLE);
        let mut skipped = HashSet::new();
        let emit = file
            .tasks()
            .iter()
            .find(|t| t.text == "Emit AST")
            .unwrap()
            .key
            .clone();
        skipped.insert(emit);
        let texts: Vec<_> = file
            .runnable_pending(&skipped)
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(texts, vec!["Ship it"]);
    }

    #[test]
    fn parent_becomes_runnable_once_children_are_checked() {
        let content = "\
- [ ] Parent
  - [x] child one
  - [x] child two
";
        let file = parse(content);
        let runnable = file.runnable_pending(&HashSet::new());
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].text, "Parent");
    }

    #[test]
    fn tab_indentation_counts_as_one_step() {
        let content = "- [ ] Parent\n\t- [ ] child\n";
        let file = parse(content);
        assert_eq!(file.tasks()[1].depth, 1);
        assert_eq!(file.tasks()[1].parent, Some(file.tasks()[0].key.clone()));
    }

    #[test]
    fn ancestors_walk_to_the_root() {
        let content = "\
- [ ] a
  - [ ] b
    - [ ] c
";
        let file = parse(content);
        let c = file.tasks()[2].key.clone();
        let chain: Vec<_> = file.ancestors(&c).iter().map(|t| t.text.as_str()).collect();
        assert_eq!(chain, vec!["b", "a"]);
    }

    #[test]
    fn empty_file_parses_to_no_tasks() {
        let file = parse("# nothing here\n\njust prose\n");
        assert!(file.tasks().is_empty());
        assert!(file.runnable_pending(&HashSet::new()).is_empty());
    }
}
