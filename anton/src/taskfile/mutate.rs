//! Task-file mutators.
//!
//! Every mutator re-parses the file, applies one edit to the parsed line
//! list, and rewrites the whole file atomically (temp file in the same
//! directory, then rename). The file on disk is the source of truth; no
//! parsed state outlives a mutation.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use tempfile::NamedTempFile;

use super::{Line, Task, TaskFile, TaskKey};
use crate::error::{Error, Result};

/// Tick the checkbox for `key`.
///
/// Returns `false` without touching the file when the task is already
/// checked.
///
/// # Errors
///
/// [`Error::UnknownTask`] when `key` is not in the file; parse and I/O
/// errors otherwise.
pub fn mark_checked(path: impl AsRef<Path>, key: &TaskKey) -> Result<bool> {
    let mut file = TaskFile::parse(&path)?;
    let task = file
        .task(key)
        .ok_or_else(|| Error::UnknownTask(key.to_string()))?;
    if task.checked {
        return Ok(false);
    }
    let line = task.line;
    set_checked(&mut file, line);
    write_atomic(&file)?;
    Ok(true)
}

/// Walk up from `key`, ticking every ancestor whose children are now all
/// checked. Returns the keys that were newly ticked, nearest first.
///
/// # Errors
///
/// [`Error::UnknownTask`] when `key` is not in the file; parse and I/O
/// errors otherwise.
pub fn auto_complete_ancestors(path: impl AsRef<Path>, key: &TaskKey) -> Result<Vec<TaskKey>> {
    let mut file = TaskFile::parse(&path)?;
    if file.task(key).is_none() {
        return Err(Error::UnknownTask(key.to_string()));
    }

    // Work off a line-indexed view of checkbox state so each tick is
    // visible to the next ancestor check without re-parsing.
    let mut checked: HashMap<usize, bool> =
        file.tasks().iter().map(|t| (t.line, t.checked)).collect();
    let by_key: HashMap<TaskKey, Task> = file
        .tasks()
        .iter()
        .map(|t| (t.key.clone(), t.clone()))
        .collect();

    let mut ticked = Vec::new();
    let mut current = by_key[key].parent.clone();
    while let Some(parent_key) = current {
        let parent = &by_key[&parent_key];
        let all_children_checked = parent
            .children
            .iter()
            .all(|c| checked.get(&by_key[c].line).copied().unwrap_or(false));
        if !all_children_checked || checked[&parent.line] {
            break;
        }
        checked.insert(parent.line, true);
        set_checked(&mut file, parent.line);
        ticked.push(parent_key.clone());
        current = parent.parent.clone();
    }

    if !ticked.is_empty() {
        write_atomic(&file)?;
    }
    Ok(ticked)
}

/// Insert unchecked sub-tasks under `parent`, after its existing subtree,
/// one indentation step deeper. Returns the new tasks' keys in insertion
/// order.
///
/// # Errors
///
/// [`Error::UnknownTask`] when `parent` is not in the file; parse and I/O
/// errors otherwise.
pub fn insert_subtasks(
    path: impl AsRef<Path>,
    parent: &TaskKey,
    children: &[String],
) -> Result<Vec<TaskKey>> {
    if children.is_empty() {
        return Ok(Vec::new());
    }
    let mut file = TaskFile::parse(&path)?;
    let parent_task = file
        .task(parent)
        .ok_or_else(|| Error::UnknownTask(parent.to_string()))?
        .clone();
    let existing_children = parent_task.children.len();

    let insert_after = subtree_last_line(&file, &parent_task);
    let parent_indent = match &file.lines[parent_task.line] {
        Line::Item { indent, .. } => indent.clone(),
        Line::Other(_) => String::new(),
    };
    let child_indent = format!("{parent_indent}  ");

    for (offset, text) in children.iter().enumerate() {
        file.lines.insert(
            insert_after + 1 + offset,
            Line::Item {
                indent: child_indent.clone(),
                checked: false,
                text: text.trim().to_string(),
            },
        );
    }
    write_atomic(&file)?;

    // Keys derive from parent path + ordinal, so re-parsing yields them.
    let reparsed = TaskFile::parse(&path)?;
    let new_parent = reparsed
        .task(parent)
        .ok_or_else(|| Error::UnknownTask(parent.to_string()))?;
    Ok(new_parent.children[existing_children..].to_vec())
}

fn set_checked(file: &mut TaskFile, line: usize) {
    if let Line::Item { checked, .. } = &mut file.lines[line] {
        *checked = true;
    }
}

/// Line index of the last line belonging to `task`'s subtree.
fn subtree_last_line(file: &TaskFile, task: &Task) -> usize {
    let mut last = task.line;
    for child_key in &task.children {
        if let Some(child) = file.task(child_key) {
            last = last.max(subtree_last_line(file, child));
        }
    }
    last
}

/// Replace the file atomically: write the rendered content to a temp file
/// in the same directory, then rename over the original.
fn write_atomic(file: &TaskFile) -> Result<()> {
    let dir = file.path().parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(file.render().as_bytes())?;
    tmp.flush()?;
    tmp.persist(file.path())
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    const SAMPLE: &str = "\
# Plan

- [ ] Parent task
  - [ ] first child
  - [ ] second child
- [ ] Standalone
";

    fn write_sample(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("tasks.md");
        fs::write(&path, content).unwrap();
        path
    }

    fn key_of(path: &Path, text: &str) -> TaskKey {
        TaskFile::parse(path)
            .unwrap()
            .tasks()
            .iter()
            .find(|t| t.text == text)
            .unwrap()
            .key
            .clone()
    }

    #[test]
    fn mark_checked_ticks_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let key = key_of(&path, "first child");

        assert!(mark_checked(&path, &key).unwrap());
        let file = TaskFile::parse(&path).unwrap();
        assert!(file.task(&key).unwrap().checked);

        // Second call is a no-op.
        assert!(!mark_checked(&path, &key).unwrap());
    }

    #[test]
    fn mark_checked_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let err = mark_checked(&path, &TaskKey::from("9:deadbeef")).unwrap_err();
        assert!(matches!(err, Error::UnknownTask(_)));
    }

    #[test]
    fn auto_complete_ticks_ancestors_when_children_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let first = key_of(&path, "first child");
        let second = key_of(&path, "second child");
        let parent = key_of(&path, "Parent task");

        mark_checked(&path, &first).unwrap();
        assert!(auto_complete_ancestors(&path, &first).unwrap().is_empty());

        mark_checked(&path, &second).unwrap();
        let ticked = auto_complete_ancestors(&path, &second).unwrap();
        assert_eq!(ticked, vec![parent.clone()]);

        let file = TaskFile::parse(&path).unwrap();
        assert!(file.task(&parent).unwrap().checked);
        // Invariant: every ancestor is checked iff all descendants are.
        assert!(file.descendants_checked(&parent));
    }

    #[test]
    fn auto_complete_walks_multiple_levels() {
        let content = "\
- [ ] root
  - [ ] mid
    - [ ] leaf
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, content);
        let leaf = key_of(&path, "leaf");

        mark_checked(&path, &leaf).unwrap();
        let ticked = auto_complete_ancestors(&path, &leaf).unwrap();
        assert_eq!(ticked.len(), 2);

        let file = TaskFile::parse(&path).unwrap();
        assert!(file.tasks().iter().all(|t| t.checked));
    }

    #[test]
    fn insert_subtasks_lands_under_the_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let parent = key_of(&path, "Parent task");

        let new_keys = insert_subtasks(
            &path,
            &parent,
            &["third child".to_string(), "fourth child".to_string()],
        )
        .unwrap();
        assert_eq!(new_keys.len(), 2);

        let file = TaskFile::parse(&path).unwrap();
        let parent_task = file.task(&parent).unwrap();
        assert_eq!(parent_task.children.len(), 4);
        let texts: Vec<_> = parent_task
            .children
            .iter()
            .map(|k| file.task(k).unwrap().text.clone())
            .collect();
        assert_eq!(
            texts,
            vec!["first child", "second child", "third child", "fourth child"]
        );
        // Insertion keeps existing keys stable.
        assert_eq!(key_of(&path, "first child"), key_of(&path, "first child"));
        assert!(file.task(&new_keys[0]).is_some());
    }

    #[test]
    fn insert_subtasks_under_a_leaf_makes_it_a_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let standalone = key_of(&path, "Standalone");

        let new_keys =
            insert_subtasks(&path, &standalone, &["sub a".to_string(), "sub b".to_string()])
                .unwrap();
        let file = TaskFile::parse(&path).unwrap();
        let parent = file.task(&standalone).unwrap();
        assert_eq!(parent.children, new_keys);

        // The parent is no longer runnable; its new children are.
        let runnable = file.runnable_pending(&HashSet::new());
        assert!(runnable.iter().any(|t| t.text == "sub a"));
        assert!(!runnable.iter().any(|t| t.text == "Standalone"));
    }

    #[test]
    fn mutations_preserve_surrounding_prose() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let key = key_of(&path, "Standalone");
        mark_checked(&path, &key).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# Plan\n"));
        assert!(content.contains("- [x] Standalone"));
    }
}
