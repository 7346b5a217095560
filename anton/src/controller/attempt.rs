//! One implementation attempt.
//!
//! An attempt composes the prompt (trimming retry context progressively to
//! fit the token budget), spawns a fresh session, races it against the
//! task timer and the abort flag, survives tool-loop breaks via bounded
//! auto-continues and one infra recovery, parses the `<anton-result>`
//! block (with a one-shot repair), enforces the per-attempt token
//! guardrail, and dispatches the agent's verdict: verification and commit
//! on `done`, sub-task insertion on `decompose`, rollback otherwise.
//!
//! Nothing here throws past the attempt: every failure becomes an
//! [`AttemptRecord`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::context::estimate::CHARS_PER_TOKEN;
use crate::contract::{AntonStatus, parse_anton_result};
use crate::controller::retry::{RetryTrim, compose_retry_context};
use crate::controller::rollback::rollback;
use crate::controller::state::{AttemptRecord, AttemptStatus, RunState};
use crate::git::GitAdapter;
use crate::hooks::RunHooks;
use crate::prompts::{
    ANTON_RESULT_CONTRACT, AUTO_CONTINUE_PROMPT, RESULT_REPAIR_PROMPT, implementation_prompt,
};
use crate::session::{
    AgentSession, AskHooks, AskOutcome, AskReply, CompactionEvent, SessionConfig, SessionFactory,
    ToolLoopEvent,
};
use crate::taskfile::{self, Task};
use crate::vault::Vault;
use crate::verify::{CommandRunner, Verifier};

/// Error marker: the prompt would not fit even with retry context dropped.
pub const PROMPT_BUDGET_EXCEEDED: &str = "prompt-budget-exceeded";

/// Error marker: the session consumed more tokens than an attempt allows.
pub const ATTEMPT_TOKEN_BUDGET_EXCEEDED: &str = "attempt-token-budget-exceeded";

/// Everything an attempt needs from the outside.
pub struct AttemptDeps<'a> {
    /// Run configuration.
    pub config: &'a RunConfig,
    /// Working-tree access.
    pub git: &'a dyn GitAdapter,
    /// Note store.
    pub vault: &'a dyn Vault,
    /// Session spawning.
    pub factory: &'a dyn SessionFactory,
    /// L1/L2 gates.
    pub verifier: &'a Verifier,
    /// Verification command execution.
    pub runner: &'a dyn CommandRunner,
    /// Run-level event listeners.
    pub hooks: &'a dyn RunHooks,
}

impl std::fmt::Debug for AttemptDeps<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptDeps").finish_non_exhaustive()
    }
}

/// How the timed ask ended.
enum RacedAsk {
    Outcome(crate::error::Result<AskOutcome>),
    TimedOut,
    Aborted,
}

/// Run one implementation attempt for `task`.
pub async fn run_attempt(
    deps: &AttemptDeps<'_>,
    task_file_path: &Path,
    task: &Task,
    attempt_no: u32,
    state: &mut RunState,
) -> AttemptRecord {
    let config = deps.config;
    let started = Instant::now();
    let make_record = |status: AttemptStatus, tokens: u64, error: Option<String>| AttemptRecord {
        task_key: task.key.clone(),
        task_text: task.text.clone(),
        attempt: attempt_no,
        status,
        duration: started.elapsed(),
        tokens,
        verification: None,
        commit: None,
        error,
    };

    // 1. Compose the prompt, trimming retry context until it fits.
    let Some(prompt) = compose_prompt(deps, task, state).await else {
        return make_record(
            AttemptStatus::Failed,
            0,
            Some(PROMPT_BUDGET_EXCEEDED.to_string()),
        );
    };

    // 2. Snapshot untracked files for surgical rollback.
    let untracked_before = deps
        .git
        .get_untracked_files(&config.project_dir)
        .await
        .unwrap_or_default();

    let abort = state.abort_flag();
    let mut tokens_total = 0u64;
    let mut infra_recovered = false;

    // Event buffers bridging the session's sync callbacks to async hooks.
    let loop_events: Arc<Mutex<Vec<ToolLoopEvent>>> = Arc::default();
    let compactions: Arc<Mutex<Vec<CompactionEvent>>> = Arc::default();

    'fresh_session: loop {
        let session_config = SessionConfig::new(format!("attempt-{attempt_no}"))
            .system_prompt_suffix(ANTON_RESULT_CONTRACT)
            .max_iterations(config.max_iterations_per_attempt);
        let mut session = match deps.factory.spawn(session_config).await {
            Ok(session) => session,
            Err(e) => {
                return make_record(AttemptStatus::Error, tokens_total, Some(e.to_string()));
            }
        };

        let ask_hooks = {
            let loop_events = Arc::clone(&loop_events);
            let compactions = Arc::clone(&compactions);
            AskHooks {
                signal: Some(Arc::clone(&abort)),
                on_tool_loop: Some(Arc::new(move |e: &ToolLoopEvent| {
                    loop_events.lock().expect("event buffer").push(e.clone());
                })),
                on_compaction: Some(Arc::new(move |e: &CompactionEvent| {
                    compactions.lock().expect("event buffer").push(e.clone());
                })),
                on_turn_end: None,
            }
        };

        let deadline = tokio::time::Instant::now() + config.task_timeout();
        let mut next_prompt = prompt.clone();
        let mut loop_breaks = 0u32;

        let reply: AskReply = loop {
            let raced = raced_ask(&mut *session, &next_prompt, ask_hooks.clone(), deadline, &abort, config.abort_poll()).await;
            match raced {
                RacedAsk::TimedOut => {
                    session.cancel();
                    tokens_total += session.usage().total();
                    session.close().await;
                    maybe_rollback(deps, &untracked_before).await;
                    return make_record(
                        AttemptStatus::Timeout,
                        tokens_total,
                        Some(format!("attempt exceeded {}s", config.task_timeout_sec)),
                    );
                }
                RacedAsk::Aborted => {
                    session.cancel();
                    tokens_total += session.usage().total();
                    session.close().await;
                    maybe_rollback(deps, &untracked_before).await;
                    return make_record(
                        AttemptStatus::Error,
                        tokens_total,
                        Some("aborted".to_string()),
                    );
                }
                RacedAsk::Outcome(Err(e)) if e.is_infra() && !infra_recovered => {
                    warn!(error = %e, "infra failure; recovering the runtime once");
                    infra_recovered = true;
                    tokens_total += session.usage().total();
                    session.close().await;
                    if let Err(ready_err) =
                        deps.factory.ensure_runtime_ready(true).await
                    {
                        return make_record(
                            AttemptStatus::Error,
                            tokens_total,
                            Some(ready_err.to_string()),
                        );
                    }
                    continue 'fresh_session;
                }
                RacedAsk::Outcome(Err(e)) => {
                    tokens_total += session.usage().total();
                    session.close().await;
                    maybe_rollback(deps, &untracked_before).await;
                    let status = if e.is_timeout() {
                        AttemptStatus::Timeout
                    } else {
                        AttemptStatus::Error
                    };
                    return make_record(status, tokens_total, Some(e.to_string()));
                }
                RacedAsk::Outcome(Ok(AskOutcome::LoopBreak(event))) => {
                    deps.hooks.on_tool_loop(&event).await;
                    loop_breaks += 1;
                    if loop_breaks > config.tool_loop_max_retries {
                        tokens_total += session.usage().total();
                        session.close().await;
                        maybe_rollback(deps, &untracked_before).await;
                        return make_record(
                            AttemptStatus::Failed,
                            tokens_total,
                            Some(format!(
                                "tool loop not recovered after {loop_breaks} breaks: {}",
                                event.message
                            )),
                        );
                    }
                    debug!(count = loop_breaks, "auto-continuing after tool loop");
                    next_prompt = AUTO_CONTINUE_PROMPT.to_string();
                }
                RacedAsk::Outcome(Ok(AskOutcome::Completed(reply))) => break reply,
            }
        };

        // Surface buffered session events; archive salvaged facts.
        let pending_loops: Vec<ToolLoopEvent> =
            loop_events.lock().expect("event buffer").drain(..).collect();
        for event in pending_loops {
            deps.hooks.on_tool_loop(&event).await;
        }
        let pending_compactions: Vec<CompactionEvent> =
            compactions.lock().expect("event buffer").drain(..).collect();
        for event in pending_compactions {
            deps.hooks.on_compaction(&event.stats).await;
            for fact in &event.key_facts {
                if let Err(e) = deps.vault.note("key fact", fact).await {
                    warn!(error = %e, "failed to archive key fact");
                }
            }
        }

        // 5. Parse the result block, with one format-only repair turn.
        let mut parsed = parse_anton_result(&reply.text);
        if parsed.is_none() && !abort.load(Ordering::SeqCst) {
            debug!("result block missing; sending repair prompt");
            let raced = raced_ask(&mut *session, RESULT_REPAIR_PROMPT, ask_hooks.clone(), deadline, &abort, config.abort_poll()).await;
            if let RacedAsk::Outcome(Ok(AskOutcome::Completed(repair))) = raced {
                parsed = parse_anton_result(&repair.text);
            }
        }
        tokens_total += session.usage().total();

        let Some(result) = parsed else {
            session.close().await;
            maybe_rollback(deps, &untracked_before).await;
            // Malformed output is a retriable failure, never a block.
            return make_record(
                AttemptStatus::Failed,
                tokens_total,
                Some("missing or malformed <anton-result> block".to_string()),
            );
        };

        // 6. Per-attempt token guardrail.
        if tokens_total > config.max_prompt_tokens_per_attempt {
            session.close().await;
            maybe_rollback(deps, &untracked_before).await;
            return make_record(
                AttemptStatus::Failed,
                tokens_total,
                Some(ATTEMPT_TOKEN_BUDGET_EXCEEDED.to_string()),
            );
        }

        session.close().await;

        // 7. Dispatch.
        let record = match result.status {
            AntonStatus::Decompose => {
                dispatch_decompose(deps, task_file_path, task, &result.subtasks, &untracked_before, &make_record, tokens_total)
                    .await
            }
            AntonStatus::Blocked => {
                maybe_rollback(deps, &untracked_before).await;
                make_record(AttemptStatus::Blocked, tokens_total, result.reason)
            }
            AntonStatus::Failed => {
                maybe_rollback(deps, &untracked_before).await;
                make_record(AttemptStatus::Failed, tokens_total, result.reason)
            }
            AntonStatus::Done => {
                dispatch_done(deps, task_file_path, task, state, &untracked_before, &make_record, tokens_total)
                    .await
            }
        };
        return record;
    }
}

/// Compose the implementation prompt under the token budget, walking the
/// trim ladder.
async fn compose_prompt(
    deps: &AttemptDeps<'_>,
    task: &Task,
    state: &RunState,
) -> Option<String> {
    let config = deps.config;
    let book = state.bookkeeping(&task.key).cloned().unwrap_or_default();
    let plan_text = book
        .plan_file
        .as_ref()
        .and_then(|p| std::fs::read_to_string(p).ok());
    let vault_snippets = deps.vault.search(&task.text, 3).await.unwrap_or_default();
    let last = state.last_attempt_for(&task.key).cloned();

    let mut trim = RetryTrim::Full;
    loop {
        let retry_context = last
            .as_ref()
            .and_then(|l| compose_retry_context(l, &book, &config.project_dir, trim));
        let prompt = implementation_prompt(
            &task.text,
            retry_context.as_deref(),
            plan_text.as_deref(),
            &vault_snippets,
            config.max_iterations_per_attempt,
        );
        let estimated = (prompt.len() / CHARS_PER_TOKEN) as u64;
        if estimated <= config.max_prompt_tokens_per_attempt {
            return Some(prompt);
        }
        match trim.next() {
            Some(next) => {
                debug!(?next, estimated, "prompt over budget; trimming retry context");
                trim = next;
            }
            None => return None,
        }
    }
}

/// Race one ask against the attempt deadline and the abort poller.
async fn raced_ask(
    session: &mut dyn AgentSession,
    prompt: &str,
    hooks: AskHooks,
    deadline: tokio::time::Instant,
    abort: &Arc<AtomicBool>,
    poll: Duration,
) -> RacedAsk {
    let ask = session.ask(prompt, hooks);
    tokio::pin!(ask);
    tokio::select! {
        outcome = &mut ask => RacedAsk::Outcome(outcome),
        () = tokio::time::sleep_until(deadline) => RacedAsk::TimedOut,
        () = wait_for_abort(abort, poll) => RacedAsk::Aborted,
    }
}

async fn wait_for_abort(flag: &Arc<AtomicBool>, interval: Duration) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

async fn maybe_rollback(deps: &AttemptDeps<'_>, untracked_before: &[String]) {
    if !deps.config.rollback_on_fail {
        return;
    }
    if let Err(e) = rollback(
        deps.git,
        &deps.config.project_dir,
        deps.config.aggressive_clean_on_fail,
        untracked_before,
    )
    .await
    {
        warn!(error = %e, "rollback failed");
    }
}

async fn dispatch_decompose(
    deps: &AttemptDeps<'_>,
    task_file_path: &Path,
    task: &Task,
    subtasks: &[String],
    untracked_before: &[String],
    make_record: &impl Fn(AttemptStatus, u64, Option<String>) -> AttemptRecord,
    tokens: u64,
) -> AttemptRecord {
    if task.depth >= deps.config.max_decompose_depth || subtasks.is_empty() {
        maybe_rollback(deps, untracked_before).await;
        return make_record(
            AttemptStatus::Blocked,
            tokens,
            Some(format!(
                "decompose rejected at depth {} with {} subtasks",
                task.depth,
                subtasks.len()
            )),
        );
    }
    match taskfile::insert_subtasks(task_file_path, &task.key, subtasks) {
        Ok(keys) => {
            info!(task = %task.key, count = keys.len(), "task decomposed");
            make_record(AttemptStatus::Decomposed, tokens, None)
        }
        Err(e) => make_record(AttemptStatus::Error, tokens, Some(e.to_string())),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_done(
    deps: &AttemptDeps<'_>,
    task_file_path: &Path,
    task: &Task,
    state: &mut RunState,
    untracked_before: &[String],
    make_record: &impl Fn(AttemptStatus, u64, Option<String>) -> AttemptRecord,
    tokens: u64,
) -> AttemptRecord {
    let config = deps.config;
    let diff = deps
        .git
        .get_working_diff(&config.project_dir)
        .await
        .unwrap_or_default();
    let verification = deps
        .verifier
        .verify(
            deps.runner,
            &config.project_dir,
            Some(deps.factory),
            &task.text,
            &diff,
        )
        .await;

    if !verification.passed {
        maybe_rollback(deps, untracked_before).await;
        let mut record = make_record(
            AttemptStatus::Failed,
            tokens,
            Some(format!("verification failed: {}", verification.summary)),
        );
        record.verification = Some(verification);
        return record;
    }

    let commit = if config.auto_commit {
        match deps
            .git
            .commit_all(&config.project_dir, &format!("Anton: {}", task.text))
            .await
        {
            Ok(sha) => {
                state.commits += 1;
                Some(sha)
            }
            Err(e) => {
                return make_record(
                    AttemptStatus::Error,
                    tokens,
                    Some(format!("commit failed: {e}")),
                );
            }
        }
    } else {
        None
    };

    let tick = taskfile::mark_checked(task_file_path, &task.key)
        .and_then(|_| taskfile::auto_complete_ancestors(task_file_path, &task.key));
    match tick {
        Ok(ancestors) => state.auto_completed += ancestors.len() as u32,
        Err(e) => {
            return make_record(
                AttemptStatus::Error,
                tokens,
                Some(format!("task file update failed: {e}")),
            );
        }
    }

    info!(task = %task.key, commit = ?commit, "task passed verification");
    let mut record = make_record(AttemptStatus::Passed, tokens, None);
    record.verification = Some(verification);
    record.commit = commit;
    record
}
