//! The Anton lock.
//!
//! One run per (task file, project) at a time, across processes. The lock
//! is a JSON file beside the task file, refreshed by a heartbeat task
//! every few seconds; a lock whose file has not been touched for a
//! multiple of the heartbeat interval is considered stale and reclaimed.
//!
//! The lock is a scoped owner: dropping it releases the file and stops the
//! heartbeat, so every exit path, including panics, cleans up.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hooks::SharedRunHooks;

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Owning process id.
    pub pid: u32,
    /// Unix timestamp of acquisition.
    pub started_at: u64,
    /// Task file the lock covers.
    pub task_file: PathBuf,
}

/// Exclusive run lock with heartbeat.
#[derive(Debug)]
pub struct AntonLock {
    path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl AntonLock {
    /// Lock file path for a task file: a dotfile sibling.
    #[must_use]
    pub fn path_for(task_file: &Path) -> PathBuf {
        let name = task_file
            .file_name()
            .map_or_else(|| "tasks".to_string(), |n| n.to_string_lossy().to_string());
        task_file.with_file_name(format!(".{name}.anton.lock"))
    }

    /// Acquire the lock, reclaiming a stale one.
    ///
    /// # Errors
    ///
    /// [`Error::LockHeld`] when a fresh lock exists; I/O errors otherwise.
    pub fn acquire(task_file: &Path, stale_after: Duration) -> Result<Self> {
        let path = Self::path_for(task_file);

        if let Some(holder) = read_lock(&path) {
            let age = lock_age(&path);
            if age < stale_after {
                return Err(Error::LockHeld {
                    path,
                    pid: holder.pid,
                });
            }
            warn!(
                pid = holder.pid,
                age_secs = age.as_secs(),
                "reclaiming stale anton lock"
            );
            let _ = std::fs::remove_file(&path);
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: unix_now(),
            task_file: task_file.to_path_buf(),
        };
        // create_new so two processes racing for a reclaimed lock cannot
        // both win.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    let pid = read_lock(&path).map_or(0, |l| l.pid);
                    Error::LockHeld { path: path.clone(), pid }
                } else {
                    Error::Io(e)
                }
            })?;
        serde_json::to_writer(&file, &info)?;
        debug!(path = %path.display(), "acquired anton lock");

        Ok(Self {
            path,
            heartbeat: None,
            released: false,
        })
    }

    /// Start the heartbeat: refresh the lock file and fire
    /// `on_heartbeat` every `interval`.
    pub fn start_heartbeat(&mut self, interval: Duration, hooks: SharedRunHooks) {
        let path = self.path.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                refresh(&path);
                hooks.on_heartbeat().await;
            }
        }));
    }

    /// Lock file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_in_place();
    }

    fn release_in_place(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove anton lock file");
            }
        } else {
            debug!(path = %self.path.display(), "released anton lock");
        }
    }
}

impl Drop for AntonLock {
    fn drop(&mut self) {
        self.release_in_place();
    }
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn lock_age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .unwrap_or(Duration::MAX)
}

/// Rewrite the lock file so its mtime reflects the latest heartbeat.
fn refresh(path: &Path) {
    if let Some(info) = read_lock(path)
        && let Ok(json) = serde_json::to_string(&info)
    {
        let _ = std::fs::write(path, json);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::hooks::RunHooks;

    fn task_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("tasks.md");
        std::fs::write(&path, "- [ ] x\n").unwrap();
        path
    }

    #[test]
    fn second_acquire_fails_while_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = task_file(&dir);
        let lock = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
        let err = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::LockHeld { .. }));
        drop(lock);
    }

    #[test]
    fn release_allows_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let file = task_file(&dir);
        let lock = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
        let path = lock.path().to_path_buf();
        lock.release();
        assert!(!path.exists());
        let _again = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
    }

    #[test]
    fn drop_releases_even_without_explicit_release() {
        let dir = tempfile::tempdir().unwrap();
        let file = task_file(&dir);
        let path = {
            let lock = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let file = task_file(&dir);
        let lock = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
        // Forget the guard so the file stays behind, then reclaim with a
        // zero staleness window.
        std::mem::forget(lock);
        let reclaimed = AntonLock::acquire(&file, Duration::ZERO).unwrap();
        reclaimed.release();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_hooks() {
        struct Beats(AtomicUsize);

        #[async_trait]
        impl RunHooks for Beats {
            async fn on_heartbeat(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let file = task_file(&dir);
        let mut lock = AntonLock::acquire(&file, Duration::from_secs(60)).unwrap();
        let hooks = Arc::new(Beats(AtomicUsize::new(0)));
        lock.start_heartbeat(Duration::from_secs(5), hooks.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        // Let the heartbeat task run.
        tokio::task::yield_now().await;
        assert!(hooks.0.load(Ordering::SeqCst) >= 2);
        lock.release();
    }
}
