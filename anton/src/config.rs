//! Run configuration.
//!
//! Every budget and toggle the controller honors, with the canonical
//! defaults. The struct deserializes from a TOML/JSON bundle with every
//! field optional; durations are expressed in seconds (or milliseconds
//! where noted) to keep the on-disk format plain.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::ApprovalMode;

/// Configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Repository the run operates on.
    pub project_dir: PathBuf,

    /// Directory (relative to the project) where plan files live.
    pub agents_task_dir: PathBuf,

    /// Tolerate a dirty working tree at startup.
    pub allow_dirty: bool,

    /// Create and switch to this branch before the first task.
    pub branch: Option<String>,

    /// Report the would-run task list and exit without spawning sessions.
    pub dry_run: bool,

    /// Commit after each verified task.
    pub auto_commit: bool,

    /// Roll the working tree back after failed or blocked attempts.
    pub rollback_on_fail: bool,

    /// During rollback, remove *all* untracked files instead of only the
    /// ones created by the attempt.
    pub aggressive_clean_on_fail: bool,

    /// Skip a task after repeated identical failures instead of stopping
    /// the run.
    pub skip_on_fail: bool,

    /// Skip a blocked task instead of stopping the run.
    pub skip_on_blocked: bool,

    /// Retry budget per task.
    pub max_retries_per_task: u32,

    /// Consecutive identical failures before the task is skipped or the
    /// run stops.
    pub max_identical_failures: u32,

    /// Auto-continues granted per attempt after tool-loop breaks.
    pub tool_loop_max_retries: u32,

    /// Maximum decomposition depth.
    pub max_decompose_depth: usize,

    /// Run the preflight pipeline on first attempts.
    pub preflight_enabled: bool,

    /// Always run the requirements-review stage (it is otherwise forced
    /// only after a fallback plan).
    pub require_requirements_review: bool,

    /// Retry budget per preflight stage.
    pub preflight_max_retries: u32,

    /// Per-stage preflight timeout, seconds.
    pub preflight_timeout_sec: u64,

    /// Iteration cap for preflight sessions.
    pub preflight_max_iterations: usize,

    /// Iteration cap for implementation sessions.
    pub max_iterations_per_attempt: usize,

    /// Per-attempt wall-clock timeout, seconds.
    pub task_timeout_sec: u64,

    /// Prompt-size and per-attempt token guardrail.
    pub max_prompt_tokens_per_attempt: u64,

    /// Outer-loop iteration ceiling.
    pub max_run_iterations: u32,

    /// Whole-run wall-clock budget, seconds.
    pub total_timeout_sec: u64,

    /// Whole-run token budget.
    pub max_total_tokens: u64,

    /// Ceiling on tasks attempted in one run.
    pub max_tasks: u32,

    /// Lock heartbeat interval, seconds.
    pub heartbeat_sec: u64,

    /// Heartbeats after which a lock counts as stale.
    pub lock_stale_multiplier: u32,

    /// Abort-poll interval, milliseconds.
    pub abort_poll_ms: u64,

    /// Model context window, tokens.
    pub context_window: usize,

    /// Tokens reserved for model replies.
    pub reply_max_tokens: usize,

    /// Approval mode forwarded to sessions.
    pub approval_mode: ApprovalMode,

    /// Verifier configuration.
    pub verify: VerifyConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            agents_task_dir: PathBuf::from("agents/tasks"),
            allow_dirty: false,
            branch: None,
            dry_run: false,
            auto_commit: true,
            rollback_on_fail: true,
            aggressive_clean_on_fail: false,
            skip_on_fail: false,
            skip_on_blocked: false,
            max_retries_per_task: 3,
            max_identical_failures: 3,
            tool_loop_max_retries: 2,
            max_decompose_depth: 2,
            preflight_enabled: true,
            require_requirements_review: false,
            preflight_max_retries: 2,
            preflight_timeout_sec: 300,
            preflight_max_iterations: 8,
            max_iterations_per_attempt: 25,
            task_timeout_sec: 1800,
            max_prompt_tokens_per_attempt: 60_000,
            max_run_iterations: 100,
            total_timeout_sec: 4 * 3600,
            max_total_tokens: 2_000_000,
            max_tasks: 50,
            heartbeat_sec: 5,
            lock_stale_multiplier: 3,
            abort_poll_ms: 250,
            context_window: 200_000,
            reply_max_tokens: 8192,
            approval_mode: ApprovalMode::Auto,
            verify: VerifyConfig::default(),
        }
    }
}

impl RunConfig {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_sec)
    }

    /// Per-stage preflight timeout.
    #[must_use]
    pub const fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_sec)
    }

    /// Whole-run timeout.
    #[must_use]
    pub const fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_sec)
    }

    /// Lock heartbeat interval.
    #[must_use]
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec)
    }

    /// Abort-poll interval.
    #[must_use]
    pub const fn abort_poll(&self) -> Duration {
        Duration::from_millis(self.abort_poll_ms)
    }

    /// Age beyond which a foreign lock may be reclaimed.
    #[must_use]
    pub const fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec * self.lock_stale_multiplier as u64)
    }

    /// Reject configurations the controller cannot run with.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries_per_task == 0 {
            return Err(Error::config("max_retries_per_task must be at least 1"));
        }
        if self.max_identical_failures == 0 {
            return Err(Error::config("max_identical_failures must be at least 1"));
        }
        if self.heartbeat_sec == 0 {
            return Err(Error::config("heartbeat_sec must be at least 1"));
        }
        if self.context_window <= self.reply_max_tokens {
            return Err(Error::config(
                "context_window must exceed reply_max_tokens",
            ));
        }
        if self.max_iterations_per_attempt == 0 || self.preflight_max_iterations == 0 {
            return Err(Error::config("iteration caps must be at least 1"));
        }
        Ok(())
    }
}

/// Verifier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Explicit build command; detected when absent.
    pub build_command: Option<String>,
    /// Explicit test command; detected when absent.
    pub test_command: Option<String>,
    /// Explicit lint command; detected when absent.
    pub lint_command: Option<String>,
    /// Run the level-2 AI review after L1 passes.
    pub enable_l2: bool,
    /// Iteration cap for the review session.
    pub l2_max_iterations: usize,
    /// Truncation budget for stored command output, characters.
    pub max_output_chars: usize,
}

impl VerifyConfig {
    /// Defaults used when the field is absent from a config bundle.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.l2_max_iterations == 0 {
            self.l2_max_iterations = 6;
        }
        if self.max_output_chars == 0 {
            self.max_output_chars = 8000;
        }
        self
    }
}
