//! Per-run bookkeeping.
//!
//! [`RunState`] is owned exclusively by the run controller: retry counters
//! and failure signatures per task, the attempt and preflight records, run
//! totals, and the externally settable abort flag. All state is in-memory;
//! the task file on disk remains the source of truth for completion.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::taskfile::TaskKey;
use crate::verify::VerificationRecord;

/// Outcome of one implementation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Verified and (when configured) committed.
    Passed,
    /// Attempted and failed; retriable while budget remains.
    Failed,
    /// Failed on an internal error rather than an agent decision.
    Error,
    /// The per-attempt timer fired.
    Timeout,
    /// The agent reported an unresolvable obstacle.
    Blocked,
    /// The task was split into sub-tasks.
    Decomposed,
    /// The controller skipped the task.
    Skipped,
}

impl AttemptStatus {
    /// Whether this status counts as a failure for retry bookkeeping.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Error | Self::Timeout | Self::Blocked
        )
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::Decomposed => "decomposed",
            Self::Skipped => "skipped",
        }
    }
}

/// Immutable record of one (task, attempt) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Task identity.
    pub task_key: TaskKey,
    /// Task text at attempt time.
    pub task_text: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outcome.
    pub status: AttemptStatus,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Session tokens consumed by the attempt.
    pub tokens: u64,
    /// Verification outcome, when verification ran.
    pub verification: Option<VerificationRecord>,
    /// Commit hash, when the attempt committed.
    pub commit: Option<String>,
    /// Error description, when the attempt errored.
    pub error: Option<String>,
}

impl AttemptRecord {
    /// Signature used to detect consecutively identical failures.
    #[must_use]
    pub fn failure_signature(&self) -> Option<String> {
        if !self.status.is_failure() {
            return None;
        }
        let detail = self
            .error
            .as_deref()
            .or(self
                .verification
                .as_ref()
                .map(|v| v.summary.as_str()))
            .unwrap_or("");
        Some(format!("{}|{detail}", self.status.as_str()))
    }
}

/// Preflight stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreflightStage {
    /// Is-it-already-done investigation.
    Discovery,
    /// Plan review.
    RequirementsReview,
}

/// Preflight stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreflightStatus {
    /// Discovery found the task already implemented.
    Complete,
    /// Discovery produced a plan.
    Incomplete,
    /// Review approved the plan.
    Ready,
    /// The stage timer fired.
    Timeout,
    /// The stage failed.
    Error,
}

/// Record of one (task, preflight-stage) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightRecord {
    /// Task identity.
    pub task_key: TaskKey,
    /// Which stage ran.
    pub stage: PreflightStage,
    /// Stage outcome.
    pub status: PreflightStatus,
    /// Plan file produced or validated, when any.
    pub plan_file: Option<PathBuf>,
    /// Session tokens consumed.
    pub tokens: u64,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Mutable per-task counters.
#[derive(Debug, Clone, Default)]
pub struct TaskBookkeeping {
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Signature of the most recent failure.
    pub last_failure_signature: Option<String>,
    /// Length of the current identical-failure streak.
    pub consecutive_identical_failures: u32,
    /// Consecutive L2 review failures.
    pub l2_fail_count: u32,
    /// Plan file from preflight, when one exists.
    pub plan_file: Option<PathBuf>,
}

/// All mutable state for one run.
#[derive(Debug)]
pub struct RunState {
    tasks: HashMap<TaskKey, TaskBookkeeping>,
    /// Attempt records, append-only.
    pub attempts: Vec<AttemptRecord>,
    /// Preflight records, append-only.
    pub preflights: Vec<PreflightRecord>,
    /// Tasks the controller decided to skip.
    pub skipped: HashSet<TaskKey>,
    /// Session tokens consumed across the run.
    pub total_tokens: u64,
    /// Commits created.
    pub commits: u32,
    /// Outer-loop iterations consumed.
    pub iterations: u32,
    /// Tasks ticked without an implementation attempt (ancestors,
    /// discovery-complete).
    pub auto_completed: u32,
    /// Tasks already checked when the run started.
    pub pre_completed: u32,
    abort: Arc<AtomicBool>,
}

impl RunState {
    /// Fresh state wired to the given abort flag.
    #[must_use]
    pub fn new(abort: Arc<AtomicBool>) -> Self {
        Self {
            tasks: HashMap::new(),
            attempts: Vec::new(),
            preflights: Vec::new(),
            skipped: HashSet::new(),
            total_tokens: 0,
            commits: 0,
            iterations: 0,
            auto_completed: 0,
            pre_completed: 0,
            abort,
        }
    }

    /// Whether the external abort flag is set.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Shared handle to the abort flag.
    #[must_use]
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Number of distinct tasks attempted so far.
    #[must_use]
    pub fn attempted_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Bookkeeping for `key`, creating it on first touch.
    pub fn bookkeeping_mut(&mut self, key: &TaskKey) -> &mut TaskBookkeeping {
        self.tasks.entry(key.clone()).or_default()
    }

    /// Bookkeeping for `key`, if the task has been touched.
    #[must_use]
    pub fn bookkeeping(&self, key: &TaskKey) -> Option<&TaskBookkeeping> {
        self.tasks.get(key)
    }

    /// The most recent attempt for `key`.
    #[must_use]
    pub fn last_attempt_for(&self, key: &TaskKey) -> Option<&AttemptRecord> {
        self.attempts.iter().rev().find(|a| &a.task_key == key)
    }

    /// Append an attempt record and update retry bookkeeping.
    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.total_tokens += record.tokens;
        let signature = record.failure_signature();
        let book = self.bookkeeping_mut(&record.task_key);

        if record.status.is_failure() {
            book.retry_count += 1;
            if signature.is_some() && book.last_failure_signature == signature {
                book.consecutive_identical_failures += 1;
            } else {
                book.consecutive_identical_failures = 1;
            }
            book.last_failure_signature = signature;
        } else if record.status == AttemptStatus::Passed {
            book.consecutive_identical_failures = 0;
            book.last_failure_signature = None;
        }

        match record.verification.as_ref().and_then(|v| v.l2_ok) {
            Some(false) => book.l2_fail_count += 1,
            Some(true) => book.l2_fail_count = 0,
            None => {}
        }

        self.attempts.push(record);
    }

    /// Append a preflight record and account its tokens.
    pub fn record_preflight(&mut self, record: PreflightRecord) {
        self.total_tokens += record.tokens;
        self.preflights.push(record);
    }

    /// Mark a task skipped and append the corresponding attempt record.
    pub fn record_skip(&mut self, key: &TaskKey, text: &str, reason: &str) {
        self.skipped.insert(key.clone());
        let attempt = self
            .bookkeeping(key)
            .map_or(0, |b| b.retry_count)
            + 1;
        self.attempts.push(AttemptRecord {
            task_key: key.clone(),
            task_text: text.to_string(),
            attempt,
            status: AttemptStatus::Skipped,
            duration: Duration::ZERO,
            tokens: 0,
            verification: None,
            commit: None,
            error: Some(reason.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> TaskKey {
        TaskKey::from(s)
    }

    fn failed(task: &str, attempt: u32, error: &str) -> AttemptRecord {
        AttemptRecord {
            task_key: key(task),
            task_text: "task".into(),
            attempt,
            status: AttemptStatus::Failed,
            duration: Duration::from_secs(1),
            tokens: 100,
            verification: None,
            commit: None,
            error: Some(error.into()),
        }
    }

    #[test]
    fn identical_failures_extend_the_streak() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        state.record_attempt(failed("1:aaaa", 1, "tests failed"));
        state.record_attempt(failed("1:aaaa", 2, "tests failed"));
        state.record_attempt(failed("1:aaaa", 3, "different failure"));

        let book = state.bookkeeping(&key("1:aaaa")).unwrap();
        assert_eq!(book.retry_count, 3);
        assert_eq!(book.consecutive_identical_failures, 1);

        state.record_attempt(failed("1:aaaa", 4, "different failure"));
        let book = state.bookkeeping(&key("1:aaaa")).unwrap();
        assert_eq!(book.consecutive_identical_failures, 2);
    }

    #[test]
    fn pass_resets_the_streak_and_keeps_retry_count() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        state.record_attempt(failed("1:aaaa", 1, "boom"));
        state.record_attempt(AttemptRecord {
            status: AttemptStatus::Passed,
            error: None,
            ..failed("1:aaaa", 2, "")
        });
        let book = state.bookkeeping(&key("1:aaaa")).unwrap();
        assert_eq!(book.retry_count, 1);
        assert_eq!(book.consecutive_identical_failures, 0);
    }

    #[test]
    fn l2_failures_count_consecutively() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        let mut record = failed("1:aaaa", 1, "review");
        record.verification = Some(VerificationRecord {
            l2_ok: Some(false),
            ..VerificationRecord::default()
        });
        state.record_attempt(record.clone());
        record.attempt = 2;
        state.record_attempt(record);
        assert_eq!(state.bookkeeping(&key("1:aaaa")).unwrap().l2_fail_count, 2);
    }

    #[test]
    fn tokens_accumulate_across_attempts_and_preflights() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        state.record_attempt(failed("1:aaaa", 1, "x"));
        state.record_preflight(PreflightRecord {
            task_key: key("1:aaaa"),
            stage: PreflightStage::Discovery,
            status: PreflightStatus::Incomplete,
            plan_file: None,
            tokens: 50,
            duration: Duration::from_secs(2),
        });
        assert_eq!(state.total_tokens, 150);
    }

    #[test]
    fn last_attempt_is_per_task() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        state.record_attempt(failed("1:aaaa", 1, "x"));
        state.record_attempt(failed("2:bbbb", 1, "y"));
        assert_eq!(
            state.last_attempt_for(&key("1:aaaa")).unwrap().error.as_deref(),
            Some("x")
        );
    }

    #[test]
    fn skip_records_an_attempt_and_marks_the_set() {
        let mut state = RunState::new(Arc::new(AtomicBool::new(false)));
        state.record_skip(&key("1:aaaa"), "task", "max identical failures");
        assert!(state.skipped.contains(&key("1:aaaa")));
        assert_eq!(
            state.attempts.last().unwrap().status,
            AttemptStatus::Skipped
        );
    }
}
