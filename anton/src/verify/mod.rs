//! Verification of agent-completed tasks.
//!
//! When a session reports `done`, up to three level-1 gates run (build,
//! test, lint), each only when a command for it was detected or configured.
//! Lint is compared against the baseline captured at run start so only new
//! errors fail the gate. On L1 success an optional level-2 AI review judges
//! the working diff.

pub mod commands;
pub mod output;
pub mod review;

pub use commands::{VerificationCommands, detect_verification_commands};
pub use review::ReviewVerdict;

use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::VerifyConfig;
use crate::error::{Error, Result};
use crate::session::SessionFactory;

use output::{count_error_lines, filter_errors_only, truncate_middle};

/// Captured output of one verification command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Process exit code.
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout and stderr, concatenated.
    #[must_use]
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes verification command lines.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `dir` and capture its output.
    async fn run(&self, dir: &Path, command: &str) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, dir: &Path, command: &str) -> Result<CommandOutput> {
        let out = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;
        Ok(CommandOutput {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}

/// Result of verifying one attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// AND of all gates that ran.
    pub passed: bool,
    /// Build gate result, when it ran.
    pub build_ok: Option<bool>,
    /// Test gate result, when it ran.
    pub test_ok: Option<bool>,
    /// Lint gate result, when it ran.
    pub lint_ok: Option<bool>,
    /// AI review result, when it ran.
    pub l2_ok: Option<bool>,
    /// Reviewer reason, mostly for failures.
    pub l2_reason: Option<String>,
    /// Filtered, truncated command output from failing gates.
    pub command_output: String,
    /// One-line outcome description.
    pub summary: String,
}

/// Baseline state captured before the first task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline {
    /// Lint error count at run start.
    pub lint_errors: usize,
}

/// Runs the gates for one project.
#[derive(Debug, Clone)]
pub struct Verifier {
    commands: VerificationCommands,
    baseline: Baseline,
    config: VerifyConfig,
}

impl Verifier {
    /// Create a verifier over detected/configured commands and the
    /// captured baseline.
    #[must_use]
    pub fn new(commands: VerificationCommands, baseline: Baseline, config: VerifyConfig) -> Self {
        Self {
            commands,
            baseline,
            config: config.with_defaults(),
        }
    }

    /// The active command set.
    #[must_use]
    pub const fn commands(&self) -> &VerificationCommands {
        &self.commands
    }

    /// Capture the baseline lint error count. A lint run that exits
    /// non-zero but yields no countable error lines records zero errors;
    /// the exit status fallback is handled at gate time.
    pub async fn capture_baseline(
        runner: &dyn CommandRunner,
        dir: &Path,
        commands: &VerificationCommands,
    ) -> Baseline {
        let Some(lint) = commands.lint.as_deref() else {
            return Baseline::default();
        };
        match runner.run(dir, lint).await {
            Ok(out) => {
                let lint_errors = count_error_lines(&out.combined());
                info!(lint_errors, "captured lint baseline");
                Baseline { lint_errors }
            }
            Err(e) => {
                warn!(error = %e, "baseline lint run failed; assuming zero errors");
                Baseline::default()
            }
        }
    }

    /// Run the L1 gates and, when configured, the L2 review.
    pub async fn verify(
        &self,
        runner: &dyn CommandRunner,
        dir: &Path,
        session_factory: Option<&dyn SessionFactory>,
        task_text: &str,
        diff: &str,
    ) -> VerificationRecord {
        let mut record = VerificationRecord::default();
        let mut failures = String::new();

        record.build_ok = self
            .gate(runner, dir, self.commands.build.as_deref(), "build", &mut failures)
            .await;
        record.test_ok = self
            .gate(runner, dir, self.commands.test.as_deref(), "test", &mut failures)
            .await;
        record.lint_ok = self.lint_gate(runner, dir, &mut failures).await;

        let l1_passed = [record.build_ok, record.test_ok, record.lint_ok]
            .iter()
            .all(|g| g.unwrap_or(true));

        if l1_passed
            && self.config.enable_l2
            && let Some(factory) = session_factory
        {
            match review::run_l2_review(factory, self.config.l2_max_iterations, task_text, diff)
                .await
            {
                Ok(verdict) => {
                    record.l2_ok = Some(verdict.pass);
                    record.l2_reason = verdict.reason;
                }
                Err(e) => {
                    // An unavailable reviewer is not a gate failure.
                    warn!(error = %e, "L2 review could not run");
                }
            }
        }

        record.passed = l1_passed && record.l2_ok.unwrap_or(true);
        record.command_output = truncate_middle(&failures, self.config.max_output_chars);
        record.summary = summarize(&record);
        record
    }

    async fn gate(
        &self,
        runner: &dyn CommandRunner,
        dir: &Path,
        command: Option<&str>,
        name: &str,
        failures: &mut String,
    ) -> Option<bool> {
        let command = command?;
        match runner.run(dir, command).await {
            Ok(out) if out.success() => Some(true),
            Ok(out) => {
                let _ = writeln!(
                    failures,
                    "## {name} failed (exit {}): {command}\n{}",
                    out.code,
                    filter_errors_only(&out.combined(), 20)
                );
                Some(false)
            }
            Err(e) => {
                let _ = writeln!(failures, "## {name} could not run: {e}");
                Some(false)
            }
        }
    }

    /// Lint compares against the baseline: only new errors fail.
    async fn lint_gate(
        &self,
        runner: &dyn CommandRunner,
        dir: &Path,
        failures: &mut String,
    ) -> Option<bool> {
        let command = self.commands.lint.as_deref()?;
        match runner.run(dir, command).await {
            Ok(out) => {
                let combined = out.combined();
                let errors = count_error_lines(&combined);
                let ok = if errors == 0 && !out.success() {
                    // No countable errors: fall back to exit status, but
                    // only when the baseline run was clean.
                    self.baseline.lint_errors > 0 || out.success()
                } else {
                    errors <= self.baseline.lint_errors
                };
                if !ok {
                    let _ = writeln!(
                        failures,
                        "## lint failed ({errors} errors, baseline {}): {command}\n{}",
                        self.baseline.lint_errors,
                        filter_errors_only(&combined, 20)
                    );
                }
                Some(ok)
            }
            Err(e) => {
                let _ = writeln!(failures, "## lint could not run: {e}");
                Some(false)
            }
        }
    }
}

fn summarize(record: &VerificationRecord) -> String {
    let gate = |name: &str, value: Option<bool>| match value {
        None => None,
        Some(true) => Some(format!("{name} ok")),
        Some(false) => Some(format!("{name} FAILED")),
    };
    let mut parts: Vec<String> = [
        gate("build", record.build_ok),
        gate("test", record.test_ok),
        gate("lint", record.lint_ok),
        gate("review", record.l2_ok),
    ]
    .into_iter()
    .flatten()
    .collect();
    if parts.is_empty() {
        parts.push("no verification gates configured".to_string());
    }
    parts.join(", ")
}
