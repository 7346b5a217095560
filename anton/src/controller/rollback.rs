//! Working-tree rollback after failed attempts.

use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::git::GitAdapter;

/// Restore the tree after a failed, blocked, or errored attempt.
///
/// Tracked changes are always reverted. Untracked files are removed
/// aggressively (all of them) or surgically: only the ones that appeared
/// since `untracked_before`, the snapshot taken at attempt start.
pub async fn rollback(
    git: &dyn GitAdapter,
    dir: &Path,
    aggressive: bool,
    untracked_before: &[String],
) -> Result<()> {
    git.restore_tracked_changes(dir).await?;

    if aggressive {
        info!("rollback: removing all untracked files");
        git.clean_untracked(dir).await?;
        return Ok(());
    }

    let now = git.get_untracked_files(dir).await?;
    let new_files: Vec<String> = now
        .into_iter()
        .filter(|f| !untracked_before.contains(f))
        .collect();
    if !new_files.is_empty() {
        info!(count = new_files.len(), "rollback: removing files created by the attempt");
        git.remove_untracked_files(dir, &new_files).await?;
    }
    Ok(())
}
