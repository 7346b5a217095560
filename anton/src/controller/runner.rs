//! The run controller.
//!
//! [`RunController`] owns a run end to end: acquire the Anton lock and
//! start its heartbeat, parse the task file, detect verification commands
//! and capture the lint baseline, assert a clean tree, then loop: pick
//! the next runnable task, enforce every budget, run preflight and the
//! implementation attempt, and keep the bookkeeping, until a stop reason
//! is reached. Errors never escape the loop; they become attempt records.
//! The lock is released on every exit path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::{info, info_span, warn};
use tracing::Instrument as _;

use crate::config::RunConfig;
use crate::controller::attempt::{
    ATTEMPT_TOKEN_BUDGET_EXCEEDED, AttemptDeps, PROMPT_BUDGET_EXCEEDED, run_attempt,
};
use crate::controller::lock::AntonLock;
use crate::controller::preflight::{PreflightOutcome, run_preflight};
use crate::controller::state::{AttemptStatus, RunState};
use crate::controller::summary::{RunSummary, StopReason, build_summary};
use crate::error::{Error, Result};
use crate::git::GitAdapter;
use crate::hooks::{NoopRunHooks, SharedRunHooks};
use crate::session::SessionFactory;
use crate::taskfile::{Task, TaskFile};
use crate::vault::{FAILURE_NOTE_KEY, Vault};
use crate::verify::{CommandRunner, VerificationCommands, Verifier, detect_verification_commands};

/// Drives one run over one repository.
pub struct RunController {
    config: RunConfig,
    git: Arc<dyn GitAdapter>,
    vault: Arc<dyn Vault>,
    factory: Arc<dyn SessionFactory>,
    runner: Arc<dyn CommandRunner>,
    hooks: SharedRunHooks,
    abort: Arc<AtomicBool>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Create a controller with no-op hooks.
    #[must_use]
    pub fn new(
        config: RunConfig,
        git: Arc<dyn GitAdapter>,
        vault: Arc<dyn Vault>,
        factory: Arc<dyn SessionFactory>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            git,
            vault,
            factory,
            runner,
            hooks: Arc::new(NoopRunHooks),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach run-level hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: SharedRunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// The externally settable abort flag. Setting it cancels the active
    /// session, prevents new attempts, and ends the run with
    /// [`StopReason::Abort`].
    #[must_use]
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Execute the run.
    ///
    /// # Errors
    ///
    /// Only [`Error::TaskFileInvalid`], [`Error::LockHeld`],
    /// [`Error::RuntimeNotReady`], and startup git/config failures
    /// propagate; everything after the loop starts becomes attempt
    /// records.
    pub async fn run(&self, task_file_path: &Path) -> Result<RunSummary> {
        self.config.validate()?;
        let started = Instant::now();

        let mut lock = AntonLock::acquire(task_file_path, self.config.lock_stale_after())?;
        lock.start_heartbeat(self.config.heartbeat(), Arc::clone(&self.hooks));

        let span = info_span!(
            "run",
            task_file = %task_file_path.display(),
            project = %self.config.project_dir.display(),
        );
        let result = self
            .run_locked(task_file_path, started)
            .instrument(span)
            .await;

        // Guaranteed release; the Drop guard covers panics.
        lock.release();

        if let Ok(summary) = &result {
            self.hooks.on_run_end(summary).await;
        }
        result
    }

    async fn run_locked(&self, task_file_path: &Path, started: Instant) -> Result<RunSummary> {
        let config = &self.config;
        let initial = TaskFile::parse(task_file_path)?;
        let mut state = RunState::new(Arc::clone(&self.abort));
        state.pre_completed = initial.completed().len() as u32;

        let explicit = VerificationCommands {
            build: config.verify.build_command.clone(),
            test: config.verify.test_command.clone(),
            lint: config.verify.lint_command.clone(),
        };
        let commands = explicit.or(detect_verification_commands(&config.project_dir));
        let baseline =
            Verifier::capture_baseline(self.runner.as_ref(), &config.project_dir, &commands).await;
        let verifier = Verifier::new(commands, baseline, config.verify.clone());

        if !config.allow_dirty {
            self.git
                .ensure_clean_working_tree(&config.project_dir)
                .await?;
        }
        if let Some(branch) = &config.branch {
            self.git.create_branch(&config.project_dir, branch).await?;
        }

        if config.dry_run {
            let runnable = initial.runnable_pending(&HashSet::new());
            info!(count = runnable.len(), "dry run: tasks that would be attempted");
            for task in &runnable {
                info!(key = %task.key, text = %task.text, "would run");
            }
            return Ok(build_summary(
                &state,
                &initial,
                StopReason::AllDone,
                started.elapsed(),
            ));
        }

        let stop_reason = self
            .task_loop(task_file_path, &mut state, &verifier, started)
            .await?;

        let final_file = TaskFile::parse(task_file_path)?;
        Ok(build_summary(
            &state,
            &final_file,
            stop_reason,
            started.elapsed(),
        ))
    }

    async fn task_loop(
        &self,
        task_file_path: &Path,
        state: &mut RunState,
        verifier: &Verifier,
        started: Instant,
    ) -> Result<StopReason> {
        let config = &self.config;

        loop {
            // 1-2. Re-read the file, compute runnables minus skips.
            let file = TaskFile::parse(task_file_path)?;
            let runnable: Vec<Task> = file
                .runnable_pending(&state.skipped)
                .into_iter()
                .cloned()
                .collect();

            // 3. Nothing left to do.
            let Some(task) = runnable.first().cloned() else {
                return Ok(StopReason::AllDone);
            };

            // 4. Budgets, each firing at its threshold.
            if state.aborted() {
                return Ok(StopReason::Abort);
            }
            if state.iterations >= config.max_run_iterations {
                return Ok(StopReason::MaxIterations);
            }
            if started.elapsed() >= config.total_timeout() {
                return Ok(StopReason::TotalTimeout);
            }
            if state.total_tokens >= config.max_total_tokens {
                return Ok(StopReason::TokenBudget);
            }
            if state.bookkeeping(&task.key).is_none()
                && state.attempted_tasks() as u32 >= config.max_tasks
            {
                return Ok(StopReason::MaxTasksExceeded);
            }
            state.iterations += 1;

            // 5-7. Attempt number and terminal-failure gates.
            let book = state.bookkeeping(&task.key).cloned().unwrap_or_default();
            let attempt_no = book.retry_count + 1;

            if book.consecutive_identical_failures >= config.max_identical_failures {
                if !config.skip_on_fail {
                    warn!(task = %task.key, "identical failures exhausted; stopping");
                    return Ok(StopReason::FatalError);
                }
                self.skip(state, &task, "max identical failures reached").await;
                continue;
            }
            if book.retry_count >= config.max_retries_per_task {
                if !config.skip_on_fail {
                    warn!(task = %task.key, "retries exhausted; stopping");
                    return Ok(StopReason::FatalError);
                }
                self.skip(state, &task, "retry budget exhausted").await;
                continue;
            }

            // 8. Announce.
            self.hooks.on_task_start(&task, attempt_no).await;
            let task_span = info_span!("task", key = %task.key, attempt = attempt_no);

            // 9. Preflight, first attempt only.
            if attempt_no == 1 && config.preflight_enabled {
                let preflight = run_preflight(
                    config,
                    self.factory.as_ref(),
                    self.hooks.as_ref(),
                    task_file_path,
                    &task,
                    state,
                )
                .instrument(task_span.clone())
                .await;
                match preflight {
                    Ok(PreflightOutcome::AlreadyComplete) => {
                        info!(task = %task.key, "preflight: already complete");
                        continue;
                    }
                    Ok(outcome) => {
                        state.bookkeeping_mut(&task.key).plan_file =
                            outcome.plan_file().map(Path::to_path_buf);
                    }
                    Err(e) if e.is_aborted() => return Ok(StopReason::Abort),
                    Err(Error::RuntimeNotReady(msg)) => {
                        return Err(Error::RuntimeNotReady(msg));
                    }
                    Err(e) => {
                        // Preflight failures degrade into a failed attempt.
                        warn!(task = %task.key, error = %e, "preflight failed");
                        state.record_attempt(crate::controller::state::AttemptRecord {
                            task_key: task.key.clone(),
                            task_text: task.text.clone(),
                            attempt: attempt_no,
                            status: AttemptStatus::Error,
                            duration: std::time::Duration::ZERO,
                            tokens: 0,
                            verification: None,
                            commit: None,
                            error: Some(e.to_string()),
                        });
                        continue;
                    }
                }
            }

            // 10. The implementation attempt.
            let deps = AttemptDeps {
                config,
                git: self.git.as_ref(),
                vault: self.vault.as_ref(),
                factory: self.factory.as_ref(),
                verifier,
                runner: self.runner.as_ref(),
                hooks: self.hooks.as_ref(),
            };
            let record = run_attempt(&deps, task_file_path, &task, attempt_no, state)
                .instrument(task_span)
                .await;

            let status = record.status;
            let error_marker = record.error.clone();

            // 11-12. Bookkeeping, then announce the outcome.
            self.hooks.on_task_end(&task, &record).await;
            state.record_attempt(record);

            if matches!(
                error_marker.as_deref(),
                Some(PROMPT_BUDGET_EXCEEDED | ATTEMPT_TOKEN_BUDGET_EXCEEDED)
            ) {
                // Budget overruns are terminal for the task.
                state.bookkeeping_mut(&task.key).retry_count = config.max_retries_per_task;
            }

            if status.is_failure() {
                let note = format!(
                    "task `{}` attempt {attempt_no} {}: {}",
                    task.text,
                    status.as_str(),
                    error_marker.as_deref().unwrap_or("no detail")
                );
                if let Err(e) = self.vault.note(FAILURE_NOTE_KEY, &note).await {
                    warn!(error = %e, "failed to record failure note");
                }
            }

            // 13. Loop control.
            if state.aborted() || error_marker.as_deref() == Some("aborted") {
                return Ok(StopReason::Abort);
            }
            if status == AttemptStatus::Blocked {
                if config.skip_on_blocked {
                    self.skip(state, &task, "blocked").await;
                    continue;
                }
                warn!(task = %task.key, "task blocked; stopping");
                return Ok(StopReason::FatalError);
            }
        }
    }

    async fn skip(&self, state: &mut RunState, task: &Task, reason: &str) {
        info!(task = %task.key, reason, "skipping task");
        state.record_skip(&task.key, &task.text, reason);
        if let Some(record) = state.attempts.last() {
            self.hooks.on_task_end(task, record).await;
        }
    }
}
