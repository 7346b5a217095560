//! Preflight pipeline.
//!
//! Before the first implementation attempt, a discovery stage asks the
//! agent whether the task is already done and, if not, demands a plan
//! file. An optional requirements-review stage then hardens that plan.
//! Both stages share one lazily created session (closed on error before a
//! retry so retries start fresh), carry their own retry budgets and
//! timeouts, and degrade to a bootstrapped fallback plan rather than
//! failing the task.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::contract::{parse_discovery_decision, parse_review_decision, DiscoveryStatus};
use crate::controller::state::{PreflightRecord, PreflightStage, PreflightStatus, RunState};
use crate::error::{Error, Result, SessionErrorKind};
use crate::hooks::RunHooks;
use crate::prompts::{
    FORCE_DECISION_PROMPT, PLAN_REWRITE_PROMPT, discovery_prompt, review_prompt,
};
use crate::session::{AgentSession, AskHooks, AskOutcome, SessionConfig, SessionFactory};
use crate::taskfile::{self, Task};

/// Ceiling multiplier for iteration-cap doubling on max-iteration errors.
const MAX_CAP_GROWTH: usize = 4;

/// What preflight decided for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightOutcome {
    /// Discovery found the task already implemented; it has been checked
    /// off.
    AlreadyComplete,
    /// An agent-written plan file is ready.
    Plan(PathBuf),
    /// Discovery could not produce a usable plan; a fallback plan with the
    /// task text was bootstrapped.
    FallbackPlan(PathBuf),
}

impl PreflightOutcome {
    /// The plan file, when one exists.
    #[must_use]
    pub fn plan_file(&self) -> Option<&Path> {
        match self {
            Self::AlreadyComplete => None,
            Self::Plan(path) | Self::FallbackPlan(path) => Some(path),
        }
    }
}

/// Lazily created session shared by both stages.
struct SharedSession<'a> {
    factory: &'a dyn SessionFactory,
    base_cap: usize,
    cap: usize,
    session: Option<Box<dyn AgentSession>>,
    tokens_seen: u64,
}

impl<'a> SharedSession<'a> {
    fn new(factory: &'a dyn SessionFactory, cap: usize) -> Self {
        Self {
            factory,
            base_cap: cap,
            cap,
            session: None,
            tokens_seen: 0,
        }
    }

    async fn get(&mut self) -> Result<&mut Box<dyn AgentSession>> {
        if self.session.is_none() {
            let config = SessionConfig::new("preflight").max_iterations(self.cap);
            self.session = Some(self.factory.spawn(config).await?);
            self.tokens_seen = 0;
        }
        Ok(self.session.as_mut().expect("session just created"))
    }

    /// Tokens consumed since the last call, across session restarts.
    fn take_tokens(&mut self) -> u64 {
        let Some(session) = self.session.as_ref() else {
            return 0;
        };
        let total = session.usage().total();
        let delta = total.saturating_sub(self.tokens_seen);
        self.tokens_seen = total;
        delta
    }

    /// Double the iteration cap, bounded, for the next spawn.
    fn grow_cap(&mut self) {
        self.cap = (self.cap * 2).min(self.base_cap * MAX_CAP_GROWTH);
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Run the preflight pipeline for `task`.
///
/// # Errors
///
/// Only aborts and a failed forced requirements review propagate; every
/// other failure degrades to [`PreflightOutcome::FallbackPlan`].
pub async fn run_preflight(
    config: &RunConfig,
    factory: &dyn SessionFactory,
    hooks: &dyn RunHooks,
    task_file_path: &Path,
    task: &Task,
    state: &mut RunState,
) -> Result<PreflightOutcome> {
    let mut shared = SharedSession::new(factory, config.preflight_max_iterations);
    let result = preflight_inner(config, &mut shared, hooks, task_file_path, task, state).await;
    shared.close().await;
    result
}

async fn preflight_inner(
    config: &RunConfig,
    shared: &mut SharedSession<'_>,
    hooks: &dyn RunHooks,
    task_file_path: &Path,
    task: &Task,
    state: &mut RunState,
) -> Result<PreflightOutcome> {
    let plan_dir = config
        .project_dir
        .join(&config.agents_task_dir)
        .join(task_slug(task));
    std::fs::create_dir_all(&plan_dir)?;

    let discovery = discovery_stage(config, shared, hooks, task_file_path, task, state, &plan_dir)
        .await?;

    let (plan, fallback) = match discovery {
        DiscoveryOutcome::Complete => return Ok(PreflightOutcome::AlreadyComplete),
        DiscoveryOutcome::Plan(path) => (path, false),
        DiscoveryOutcome::Fallback => {
            let path = bootstrap_fallback_plan(&plan_dir, task)?;
            (path, true)
        }
    };

    if config.require_requirements_review || fallback {
        review_stage(config, shared, hooks, task, state, &plan, fallback).await?;
    }

    if fallback {
        Ok(PreflightOutcome::FallbackPlan(plan))
    } else {
        Ok(PreflightOutcome::Plan(plan))
    }
}

enum DiscoveryOutcome {
    Complete,
    Plan(PathBuf),
    Fallback,
}

#[allow(clippy::too_many_arguments)]
async fn discovery_stage(
    config: &RunConfig,
    shared: &mut SharedSession<'_>,
    hooks: &dyn RunHooks,
    task_file_path: &Path,
    task: &Task,
    state: &mut RunState,
    plan_dir: &Path,
) -> Result<DiscoveryOutcome> {
    let prompt = discovery_prompt(&task.text, &plan_dir.display().to_string());

    for round in 0..=config.preflight_max_retries {
        if state.aborted() {
            return Err(Error::session(SessionErrorKind::Aborted, "preflight aborted"));
        }
        let started = Instant::now();

        let reply = match stage_ask(config, shared, state, &prompt).await {
            StageAsk::Reply(reply) => reply,
            StageAsk::Timeout => {
                record_stage(
                    state, hooks, task, PreflightStage::Discovery, PreflightStatus::Timeout,
                    None, shared.take_tokens(), started,
                )
                .await;
                shared.close().await;
                continue;
            }
            StageAsk::MaxIterations => {
                debug!(round, "discovery hit max iterations; doubling the cap");
                shared.grow_cap();
                shared.close().await;
                continue;
            }
            StageAsk::Fatal(e) => return Err(e),
            StageAsk::Retriable => {
                record_stage(
                    state, hooks, task, PreflightStage::Discovery, PreflightStatus::Error,
                    None, shared.take_tokens(), started,
                )
                .await;
                shared.close().await;
                continue;
            }
        };

        // Invalid JSON gets exactly one force-decision turn.
        let (decision, tool_calls) = match parse_discovery_decision(&reply.text) {
            Some(decision) => (decision, reply.tool_calls),
            None => match stage_ask(config, shared, state, FORCE_DECISION_PROMPT).await {
                StageAsk::Reply(second) => match parse_discovery_decision(&second.text) {
                    Some(decision) => (decision, reply.tool_calls + second.tool_calls),
                    None => {
                        record_stage(
                            state, hooks, task, PreflightStage::Discovery,
                            PreflightStatus::Error, None, shared.take_tokens(), started,
                        )
                        .await;
                        shared.close().await;
                        continue;
                    }
                },
                StageAsk::Fatal(e) => return Err(e),
                _ => {
                    shared.close().await;
                    continue;
                }
            },
        };

        if decision.status == DiscoveryStatus::Complete {
            info!(task = %task.key, "discovery: already implemented");
            let ticked_ancestors = mark_complete(task_file_path, task)?;
            state.auto_completed += 1 + ticked_ancestors;
            record_stage(
                state, hooks, task, PreflightStage::Discovery, PreflightStatus::Complete,
                None, shared.take_tokens(), started,
            )
            .await;
            return Ok(DiscoveryOutcome::Complete);
        }

        // Incomplete: the named plan file must exist and be non-empty.
        let mut filename = decision.filename;
        if !filename.is_empty() && tool_calls == 0 {
            // Claimed a file without touching the filesystem.
            if let StageAsk::Reply(rewrite) =
                stage_ask(config, shared, state, PLAN_REWRITE_PROMPT).await
                && let Some(second) = parse_discovery_decision(&rewrite.text)
                && !second.filename.is_empty()
            {
                filename = second.filename;
            }
        }

        let mut plan = resolve_plan_path(&config.project_dir, &filename);
        if !plan_file_valid(plan.as_deref()) {
            // One rewrite attempt, then fall back.
            if let StageAsk::Reply(rewrite) =
                stage_ask(config, shared, state, PLAN_REWRITE_PROMPT).await
                && let Some(second) = parse_discovery_decision(&rewrite.text)
            {
                plan = resolve_plan_path(&config.project_dir, &second.filename);
            }
        }

        return match plan_file_valid(plan.as_deref()) {
            true => {
                let plan = plan.expect("validated path");
                record_stage(
                    state, hooks, task, PreflightStage::Discovery, PreflightStatus::Incomplete,
                    Some(plan.clone()), shared.take_tokens(), started,
                )
                .await;
                state.bookkeeping_mut(&task.key).plan_file = Some(plan.clone());
                Ok(DiscoveryOutcome::Plan(plan))
            }
            false => {
                warn!(task = %task.key, "discovery plan unusable; bootstrapping fallback");
                record_stage(
                    state, hooks, task, PreflightStage::Discovery, PreflightStatus::Error,
                    None, shared.take_tokens(), started,
                )
                .await;
                Ok(DiscoveryOutcome::Fallback)
            }
        };
    }

    warn!(task = %task.key, "discovery retries exhausted; bootstrapping fallback");
    Ok(DiscoveryOutcome::Fallback)
}

#[allow(clippy::too_many_arguments)]
async fn review_stage(
    config: &RunConfig,
    shared: &mut SharedSession<'_>,
    hooks: &dyn RunHooks,
    task: &Task,
    state: &mut RunState,
    plan: &Path,
    forced: bool,
) -> Result<()> {
    let prompt = review_prompt(&task.text, &plan.display().to_string());

    for _round in 0..=config.preflight_max_retries {
        if state.aborted() {
            return Err(Error::session(SessionErrorKind::Aborted, "preflight aborted"));
        }
        let started = Instant::now();

        let reply = match stage_ask(config, shared, state, &prompt).await {
            StageAsk::Reply(reply) => reply,
            StageAsk::Timeout => {
                record_stage(
                    state, hooks, task, PreflightStage::RequirementsReview,
                    PreflightStatus::Timeout, None, shared.take_tokens(), started,
                )
                .await;
                shared.close().await;
                continue;
            }
            StageAsk::MaxIterations => {
                shared.grow_cap();
                shared.close().await;
                continue;
            }
            StageAsk::Fatal(e) => return Err(e),
            StageAsk::Retriable => {
                shared.close().await;
                continue;
            }
        };

        let decision = match parse_review_decision(&reply.text) {
            Some(decision) => Some(decision),
            None => match stage_ask(config, shared, state, FORCE_DECISION_PROMPT).await {
                StageAsk::Reply(second) => parse_review_decision(&second.text),
                StageAsk::Fatal(e) => return Err(e),
                _ => None,
            },
        };

        if decision.is_some() {
            record_stage(
                state, hooks, task, PreflightStage::RequirementsReview, PreflightStatus::Ready,
                Some(plan.to_path_buf()), shared.take_tokens(), started,
            )
            .await;
            return Ok(());
        }

        record_stage(
            state, hooks, task, PreflightStage::RequirementsReview, PreflightStatus::Error,
            None, shared.take_tokens(), started,
        )
        .await;
        shared.close().await;
    }

    if forced {
        return Err(Error::session(
            SessionErrorKind::Other,
            "requirements review failed after a fallback plan",
        ));
    }
    // Optional review failing is tolerable; the existing plan stands.
    Ok(())
}

/// Result of one timed ask against the shared session.
enum StageAsk {
    Reply(crate::session::AskReply),
    Timeout,
    MaxIterations,
    Retriable,
    Fatal(Error),
}

async fn stage_ask(
    config: &RunConfig,
    shared: &mut SharedSession<'_>,
    state: &RunState,
    prompt: &str,
) -> StageAsk {
    let hooks = AskHooks {
        signal: Some(state.abort_flag()),
        ..AskHooks::default()
    };
    let session = match shared.get().await {
        Ok(session) => session,
        Err(e) => return StageAsk::Fatal(e),
    };
    let outcome = timeout(config.preflight_timeout(), session.ask(prompt, hooks)).await;
    match outcome {
        Err(_) => {
            session.cancel();
            StageAsk::Timeout
        }
        Ok(Err(e)) if e.is_aborted() => StageAsk::Fatal(e),
        Ok(Err(e)) if e.is_max_iterations() => StageAsk::MaxIterations,
        Ok(Err(e)) => {
            warn!(error = %e, "preflight ask failed");
            StageAsk::Retriable
        }
        Ok(Ok(AskOutcome::Completed(reply))) => StageAsk::Reply(reply),
        Ok(Ok(AskOutcome::LoopBreak(event))) => {
            warn!(detector = %event.detector, "tool loop during preflight");
            StageAsk::Retriable
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn record_stage(
    state: &mut RunState,
    hooks: &dyn RunHooks,
    task: &Task,
    stage: PreflightStage,
    status: PreflightStatus,
    plan_file: Option<PathBuf>,
    tokens: u64,
    started: Instant,
) {
    let record = PreflightRecord {
        task_key: task.key.clone(),
        stage,
        status,
        plan_file,
        tokens,
        duration: started.elapsed(),
    };
    hooks.on_preflight(task, &record).await;
    state.record_preflight(record);
}

/// Tick the task and auto-complete its ancestors. Returns how many
/// ancestors were ticked.
fn mark_complete(task_file_path: &Path, task: &Task) -> Result<u32> {
    taskfile::mark_checked(task_file_path, &task.key)?;
    let ticked = taskfile::auto_complete_ancestors(task_file_path, &task.key)?;
    Ok(ticked.len() as u32)
}

/// Write the fallback plan: the task text, verbatim, as the whole plan.
fn bootstrap_fallback_plan(plan_dir: &Path, task: &Task) -> Result<PathBuf> {
    let path = plan_dir.join("fallback-plan.md");
    let content = format!(
        "# Plan\n\nImplement exactly this task:\n\n{}\n\nKeep the change minimal and verify \
         the project still builds.\n",
        task.text
    );
    std::fs::write(&path, content)?;
    Ok(path)
}

fn resolve_plan_path(project_dir: &Path, filename: &str) -> Option<PathBuf> {
    if filename.trim().is_empty() {
        return None;
    }
    let candidate = Path::new(filename);
    Some(if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_dir.join(candidate)
    })
}

fn plan_file_valid(path: Option<&Path>) -> bool {
    path.and_then(|p| std::fs::metadata(p).ok())
        .is_some_and(|m| m.is_file() && m.len() > 0)
}

/// Filesystem-safe directory name for a task.
#[must_use]
pub fn task_slug(task: &Task) -> String {
    let mut slug: String = task
        .text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let short: String = slug.chars().take(40).collect();
    // The key embeds position, so equal texts under different parents
    // still get distinct directories.
    let key_part = task.key.as_str().replace([':', '.'], "-");
    format!("{short}-{key_part}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::hooks::NoopRunHooks;
    use crate::session::AskReply;
    use crate::taskfile::TaskFile;
    use crate::usage::Usage;

    /// One scripted reply for a session `ask`.
    #[derive(Clone)]
    enum Script {
        Reply { text: String, tool_calls: usize },
        Fail(SessionErrorKind),
    }

    struct ScriptedSession {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        usage: Usage,
        closed: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl AgentSession for ScriptedSession {
        async fn ask(&mut self, _prompt: &str, hooks: AskHooks) -> Result<AskOutcome> {
            if hooks
                .signal
                .as_ref()
                .is_some_and(|s| s.load(std::sync::atomic::Ordering::SeqCst))
            {
                return Err(Error::session(SessionErrorKind::Aborted, "aborted"));
            }
            self.usage += Usage::new(100, 20);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Fail(SessionErrorKind::Other));
            match script {
                Script::Reply { text, tool_calls } => Ok(AskOutcome::Completed(AskReply {
                    text,
                    turns: 1,
                    tool_calls,
                })),
                Script::Fail(kind) => Err(Error::session(kind, "scripted failure")),
            }
        }

        fn cancel(&mut self) {}

        async fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }

        fn usage(&self) -> Usage {
            self.usage
        }

        fn get_system_prompt(&self) -> String {
            String::new()
        }

        fn set_system_prompt(&mut self, _text: String) {}
    }

    struct ScriptedFactory {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        closed: Arc<Mutex<usize>>,
    }

    impl ScriptedFactory {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Arc::new(Mutex::new(scripts.into())),
                closed: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn spawn(&self, _config: SessionConfig) -> Result<Box<dyn AgentSession>> {
            Ok(Box::new(ScriptedSession {
                scripts: Arc::clone(&self.scripts),
                usage: Usage::zero(),
                closed: Arc::clone(&self.closed),
            }))
        }

        async fn ensure_runtime_ready(&self, _force_restart: bool) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        task_file: PathBuf,
        config: RunConfig,
        state: RunState,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let task_file = dir.path().join("tasks.md");
        std::fs::write(&task_file, "- [ ] Add a greet function\n").unwrap();
        let config = RunConfig {
            project_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let state = RunState::new(Arc::new(AtomicBool::new(false)));
        Fixture {
            _dir: dir,
            task_file,
            config,
            state,
        }
    }

    fn the_task(path: &Path) -> Task {
        TaskFile::parse(path).unwrap().tasks()[0].clone()
    }

    fn json_reply(text: &str, tool_calls: usize) -> Script {
        Script::Reply {
            text: text.to_string(),
            tool_calls,
        }
    }

    #[tokio::test]
    async fn discovery_complete_checks_the_task_off() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        let factory = ScriptedFactory::new(vec![json_reply(
            r#"{"status": "complete", "filename": ""}"#,
            2,
        )]);

        let outcome = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap();

        assert_eq!(outcome, PreflightOutcome::AlreadyComplete);
        assert_eq!(fx.state.auto_completed, 1);
        assert!(TaskFile::parse(&fx.task_file).unwrap().tasks()[0].checked);
        assert_eq!(
            fx.state.preflights.last().unwrap().status,
            PreflightStatus::Complete
        );
        assert!(fx.state.total_tokens > 0);
    }

    #[tokio::test]
    async fn discovery_incomplete_returns_the_plan() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        let plan_rel = "agents/tasks/greet/plan.md";
        let plan_abs = fx.config.project_dir.join(plan_rel);
        std::fs::create_dir_all(plan_abs.parent().unwrap()).unwrap();
        std::fs::write(&plan_abs, "1. add greet\n2. test it\n").unwrap();

        let factory = ScriptedFactory::new(vec![json_reply(
            &format!(r#"{{"status": "incomplete", "filename": "{plan_rel}"}}"#),
            3,
        )]);

        let outcome = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap();

        assert_eq!(outcome, PreflightOutcome::Plan(plan_abs.clone()));
        assert_eq!(
            fx.state.bookkeeping(&task.key).unwrap().plan_file,
            Some(plan_abs)
        );
    }

    #[tokio::test]
    async fn invalid_json_recovers_through_force_decision() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        let factory = ScriptedFactory::new(vec![
            json_reply("sure, I checked and it is done already!", 1),
            json_reply(r#"{"status": "complete", "filename": ""}"#, 0),
        ]);

        let outcome = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap();
        assert_eq!(outcome, PreflightOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn unusable_plan_falls_back_and_forces_review() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        let factory = ScriptedFactory::new(vec![
            // Claims a file that does not exist, with tool calls.
            json_reply(r#"{"status": "incomplete", "filename": "agents/tasks/x/no.md"}"#, 2),
            // Rewrite attempt still names a missing file.
            json_reply(r#"{"status": "incomplete", "filename": "agents/tasks/x/no.md"}"#, 1),
            // Forced requirements review approves.
            json_reply(r#"{"status": "ready", "filename": ""}"#, 0),
        ]);

        let outcome = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap();

        let PreflightOutcome::FallbackPlan(path) = outcome else {
            panic!("expected fallback, got {outcome:?}");
        };
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Add a greet function"));
        assert!(
            fx.state
                .preflights
                .iter()
                .any(|p| p.stage == PreflightStage::RequirementsReview
                    && p.status == PreflightStatus::Ready)
        );
    }

    #[tokio::test]
    async fn exhausted_retries_bootstrap_a_fallback() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        // Every discovery round errors; forced review then approves.
        let mut scripts = vec![Script::Fail(SessionErrorKind::Other); 3];
        scripts.push(json_reply(r#"{"status": "ready", "filename": ""}"#, 0));
        let factory = ScriptedFactory::new(scripts);

        let outcome = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, PreflightOutcome::FallbackPlan(_)));
        // Error rounds close the shared session so retries start fresh.
        assert!(*factory.closed.lock().unwrap() >= 3);
    }

    #[tokio::test]
    async fn forced_review_failure_is_fatal() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        // Discovery always fails, then the forced review also fails.
        let factory = ScriptedFactory::new(vec![Script::Fail(SessionErrorKind::Other); 10]);

        let err = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("requirements review"));
    }

    #[tokio::test]
    async fn abort_cancels_preflight() {
        let mut fx = fixture();
        let task = the_task(&fx.task_file);
        fx.state.abort_flag().store(true, std::sync::atomic::Ordering::SeqCst);
        let factory = ScriptedFactory::new(vec![json_reply(
            r#"{"status": "complete", "filename": ""}"#,
            0,
        )]);

        let err = run_preflight(
            &fx.config, &factory, &NoopRunHooks, &fx.task_file, &task, &mut fx.state,
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
        // The task was not touched.
        assert!(!TaskFile::parse(&fx.task_file).unwrap().tasks()[0].checked);
    }

    #[test]
    fn task_slug_is_filesystem_safe_and_distinct() {
        let file =
            TaskFile::parse_str("/tmp/t.md", "- [ ] Fix the *weird* bug!\n- [ ] Fix the *weird* bug!\n")
                .unwrap();
        let a = task_slug(&file.tasks()[0]);
        let b = task_slug(&file.tasks()[1]);
        assert!(a.starts_with("fix-the-weird-bug"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert_ne!(a, b);
    }
}
