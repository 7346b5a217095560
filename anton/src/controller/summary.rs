//! Stop reasons and the end-of-run summary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::state::{AttemptStatus, RunState};
use crate::taskfile::TaskFile;

/// Why the run ended. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The abort flag was set externally.
    Abort,
    /// The outer-loop iteration ceiling tripped.
    MaxIterations,
    /// The whole-run wall-clock budget tripped.
    TotalTimeout,
    /// The run token budget tripped.
    TokenBudget,
    /// The attempted-task ceiling tripped.
    MaxTasksExceeded,
    /// A task failed terminally and skipping is disabled.
    FatalError,
    /// Every task is checked off.
    AllDone,
}

impl StopReason {
    /// Process exit code for this stop reason.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::AllDone => 0,
            Self::FatalError => 1,
            Self::Abort => 2,
            Self::MaxIterations | Self::TotalTimeout | Self::TokenBudget => 3,
            Self::MaxTasksExceeded => 4,
        }
    }

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::MaxIterations => "max_iterations",
            Self::TotalTimeout => "total_timeout",
            Self::TokenBudget => "token_budget",
            Self::MaxTasksExceeded => "max_tasks_exceeded",
            Self::FatalError => "fatal_error",
            Self::AllDone => "all_done",
        }
    }
}

/// End-of-run accounting. Failure counts are computed over the *last*
/// attempt per task, so a task that failed and then passed contributes
/// nothing to `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Tasks completed by a passing attempt.
    pub completed: u32,
    /// Tasks ticked without an attempt (ancestors, discovery-complete).
    pub auto_completed: u32,
    /// Tasks already checked before the run.
    pub pre_completed: u32,
    /// Tasks the controller skipped.
    pub skipped: u32,
    /// Tasks whose last attempt failed.
    pub failed: u32,
    /// Tasks still unchecked and unattempted.
    pub remaining: u32,
    /// Tasks in the file at the end of the run.
    pub total_tasks: u32,
    /// Commits created.
    pub commits: u32,
    /// Session tokens consumed.
    pub total_tokens: u64,
    /// Outer-loop iterations consumed.
    pub iterations: u32,
    /// Run duration.
    pub duration: Duration,
    /// Whether every task ended checked.
    pub completed_all: bool,
}

impl RunSummary {
    /// Sum of all task dispositions; equals `total_tasks` by construction.
    #[must_use]
    pub const fn accounted(&self) -> u32 {
        self.completed
            + self.auto_completed
            + self.pre_completed
            + self.skipped
            + self.failed
            + self.remaining
    }
}

/// Build the summary from final state and the re-read task file.
#[must_use]
pub fn build_summary(
    state: &RunState,
    file: &TaskFile,
    stop_reason: StopReason,
    duration: Duration,
) -> RunSummary {
    let total_tasks = file.tasks().len() as u32;

    let mut completed = 0u32;
    let mut failed = 0u32;
    for task in file.tasks() {
        if state.skipped.contains(&task.key) {
            continue;
        }
        match state.last_attempt_for(&task.key).map(|a| a.status) {
            Some(AttemptStatus::Passed) => completed += 1,
            Some(status) if status.is_failure() => failed += 1,
            _ => {}
        }
    }
    let skipped = state.skipped.len() as u32;
    let accounted =
        completed + state.auto_completed + state.pre_completed + skipped + failed;
    let remaining = total_tasks.saturating_sub(accounted);
    let completed_all = file.tasks().iter().all(|t| t.checked);

    RunSummary {
        stop_reason,
        completed,
        auto_completed: state.auto_completed,
        pre_completed: state.pre_completed,
        skipped,
        failed,
        remaining,
        total_tasks,
        commits: state.commits,
        total_tokens: state.total_tokens,
        iterations: state.iterations,
        duration,
        completed_all,
    }
}
