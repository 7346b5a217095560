//! Git adapter.
//!
//! The run controller is the only component allowed to touch the working
//! tree, and it does so exclusively through [`GitAdapter`]. [`ProcessGit`]
//! is the production implementation, shelling out to the `git` binary; the
//! integration tests substitute a scripted fake.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Operations the controller needs from version control.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    /// Fail unless the working tree has no staged or unstaged changes.
    async fn ensure_clean_working_tree(&self, dir: &Path) -> Result<()>;

    /// Diff of the working tree against HEAD.
    async fn get_working_diff(&self, dir: &Path) -> Result<String>;

    /// Stage everything and commit. Returns the new commit hash.
    async fn commit_all(&self, dir: &Path, message: &str) -> Result<String>;

    /// Revert all tracked modifications.
    async fn restore_tracked_changes(&self, dir: &Path) -> Result<()>;

    /// Remove every untracked file.
    async fn clean_untracked(&self, dir: &Path) -> Result<()>;

    /// Create and switch to a new branch.
    async fn create_branch(&self, dir: &Path, name: &str) -> Result<()>;

    /// Paths of untracked files, relative to `dir`.
    async fn get_untracked_files(&self, dir: &Path) -> Result<Vec<String>>;

    /// Remove the given untracked files.
    async fn remove_untracked_files(&self, dir: &Path, files: &[String]) -> Result<()>;

    /// Paths with tracked modifications, relative to `dir`.
    async fn get_changed_files(&self, dir: &Path) -> Result<Vec<String>>;
}

/// [`GitAdapter`] backed by the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGit;

impl ProcessGit {
    async fn run(dir: &Path, args: &[&str]) -> Result<String> {
        debug!(?args, dir = %dir.display(), "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: format!("git {}", args.join(" ")),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Split porcelain-style, newline-delimited output into trimmed lines.
fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl GitAdapter for ProcessGit {
    async fn ensure_clean_working_tree(&self, dir: &Path) -> Result<()> {
        let status = Self::run(dir, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            Ok(())
        } else {
            Err(Error::Git {
                command: "status --porcelain".to_string(),
                stderr: format!(
                    "working tree is not clean:\n{}",
                    status.trim_end()
                ),
            })
        }
    }

    async fn get_working_diff(&self, dir: &Path) -> Result<String> {
        Self::run(dir, &["diff", "HEAD"]).await
    }

    async fn commit_all(&self, dir: &Path, message: &str) -> Result<String> {
        Self::run(dir, &["add", "-A"]).await?;
        Self::run(dir, &["commit", "-m", message]).await?;
        let sha = Self::run(dir, &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn restore_tracked_changes(&self, dir: &Path) -> Result<()> {
        Self::run(dir, &["checkout", "--", "."]).await?;
        Ok(())
    }

    async fn clean_untracked(&self, dir: &Path) -> Result<()> {
        Self::run(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn create_branch(&self, dir: &Path, name: &str) -> Result<()> {
        Self::run(dir, &["checkout", "-b", name]).await?;
        Ok(())
    }

    async fn get_untracked_files(&self, dir: &Path) -> Result<Vec<String>> {
        let out = Self::run(dir, &["ls-files", "--others", "--exclude-standard"]).await?;
        Ok(lines(&out))
    }

    async fn remove_untracked_files(&self, dir: &Path, files: &[String]) -> Result<()> {
        for file in files {
            let path = dir.join(file);
            // Refuse anything that escapes the project directory.
            if !path.starts_with(dir) || file.contains("..") {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            remove_empty_parents(dir, &path).await;
        }
        Ok(())
    }

    async fn get_changed_files(&self, dir: &Path) -> Result<Vec<String>> {
        let out = Self::run(dir, &["diff", "--name-only", "HEAD"]).await?;
        Ok(lines(&out))
    }
}

/// Remove now-empty directories left behind by file removal, up to but not
/// including `root`.
async fn remove_empty_parents(root: &Path, removed: &Path) {
    let mut current: Option<PathBuf> = removed.parent().map(Path::to_path_buf);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if tokio::fs::remove_dir(&dir).await.is_err() {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_filters_blank_entries() {
        let parsed = lines("a.rs\n\n  b/c.rs  \n");
        assert_eq!(parsed, vec!["a.rs", "b/c.rs"]);
    }
}
