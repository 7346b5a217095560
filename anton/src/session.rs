//! The agent-session boundary.
//!
//! The kernel drives an external language-model harness exclusively through
//! [`AgentSession`] and [`SessionFactory`]. Model transport, tool
//! implementations, and harness quirks all live behind these traits.
//!
//! A tool-loop break is a *result variant* ([`AskOutcome::LoopBreak`]), not
//! an error: the controller inspects it and decides whether to auto-continue
//! the attempt. Infrastructure failures surface as
//! [`Error::Session`](crate::Error::Session) with
//! [`SessionErrorKind::Infra`](crate::error::SessionErrorKind::Infra) and are
//! recovered once per attempt through
//! [`SessionFactory::ensure_runtime_ready`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::CompactionStats;
use crate::error::Result;
use crate::usage::Usage;

/// A shared hook callback.
pub type HookFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A tool-loop event observed inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopEvent {
    /// Tool that triggered the detector.
    pub tool: String,
    /// Which detector fired.
    pub detector: String,
    /// Agent-facing description of the repetition.
    pub message: String,
    /// Repetition count at trigger time.
    pub count: u32,
}

/// Report of one in-band history compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionEvent {
    /// Accounting for the compaction pass.
    pub stats: CompactionStats,
    /// Facts extracted from the dropped messages, for vault archival.
    pub key_facts: Vec<String>,
}

/// Statistics reported at the end of each model turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurnStats {
    /// 1-based turn number within the ask.
    pub turn: usize,
    /// Cumulative session usage after the turn.
    pub usage: Usage,
    /// Tool calls issued during the turn.
    pub tool_calls: usize,
}

/// Capability record installed for one `ask`: an abort signal plus a small
/// set of named callbacks. All fields are optional.
#[derive(Clone, Default)]
pub struct AskHooks {
    /// Abort flag; the session polls it and cancels when set.
    pub signal: Option<Arc<AtomicBool>>,
    /// Fired when the loop detector flags a call.
    pub on_tool_loop: Option<HookFn<ToolLoopEvent>>,
    /// Fired after an in-band history compaction.
    pub on_compaction: Option<HookFn<CompactionEvent>>,
    /// Fired at the end of every model turn.
    pub on_turn_end: Option<HookFn<TurnStats>>,
}

impl fmt::Debug for AskHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AskHooks")
            .field("signal", &self.signal.is_some())
            .field("on_tool_loop", &self.on_tool_loop.is_some())
            .field("on_compaction", &self.on_compaction.is_some())
            .field("on_turn_end", &self.on_turn_end.is_some())
            .finish()
    }
}

/// The completed answer of an `ask`.
#[derive(Debug, Clone, Default)]
pub struct AskReply {
    /// Final response text.
    pub text: String,
    /// Model turns consumed.
    pub turns: usize,
    /// Tool calls executed.
    pub tool_calls: usize,
}

/// Result of [`AgentSession::ask`].
#[derive(Debug, Clone)]
pub enum AskOutcome {
    /// The session produced a final answer.
    Completed(AskReply),
    /// A critical tool loop interrupted the session. The session remains
    /// usable; the caller decides whether to continue it.
    LoopBreak(ToolLoopEvent),
}

impl AskOutcome {
    /// The reply, when the ask completed.
    #[must_use]
    pub const fn reply(&self) -> Option<&AskReply> {
        match self {
            Self::Completed(reply) => Some(reply),
            Self::LoopBreak(_) => None,
        }
    }
}

/// How the harness should treat tool invocations that normally require
/// confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Execute everything without asking. The supervisor runs unattended.
    #[default]
    Auto,
    /// Refuse anything that would need human confirmation.
    Deny,
}

/// Configuration for spawning a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label for tracing spans.
    pub label: String,
    /// Text appended to the harness system prompt (the Anton output
    /// contract for implementation sessions).
    pub system_prompt_suffix: String,
    /// Iteration cap for the session's internal loop.
    pub max_iterations: usize,
    /// Disable tools entirely (used by the L2 review session).
    pub no_tools: bool,
    /// Approval mode forwarded to the harness.
    pub approval_mode: ApprovalMode,
}

impl SessionConfig {
    /// A session config with the given label and defaults everywhere else.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            system_prompt_suffix: String::new(),
            max_iterations: 25,
            no_tools: false,
            approval_mode: ApprovalMode::Auto,
        }
    }

    /// Set the system-prompt suffix.
    #[must_use]
    pub fn system_prompt_suffix(mut self, text: impl Into<String>) -> Self {
        self.system_prompt_suffix = text.into();
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn max_iterations(mut self, cap: usize) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Disable tools.
    #[must_use]
    pub const fn no_tools(mut self, no_tools: bool) -> Self {
        self.no_tools = no_tools;
        self
    }
}

/// One conversation with the external agent harness.
#[async_trait]
pub trait AgentSession: Send {
    /// Send a prompt and run the harness loop to completion.
    async fn ask(&mut self, prompt: &str, hooks: AskHooks) -> Result<AskOutcome>;

    /// Cancel any in-flight work.
    fn cancel(&mut self);

    /// Release harness resources. Must be called on every exit path;
    /// sessions are not reclaimed implicitly.
    async fn close(&mut self);

    /// Cumulative token usage for this session.
    fn usage(&self) -> Usage;

    /// Current system prompt.
    fn get_system_prompt(&self) -> String;

    /// Replace the system prompt.
    fn set_system_prompt(&mut self, text: String);
}

/// Spawns sessions and manages harness runtime health.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Spawn a fresh session.
    async fn spawn(&self, config: SessionConfig) -> Result<Box<dyn AgentSession>>;

    /// Bring the harness runtime up, optionally forcing a restart. Called
    /// at most once per attempt when an infra error is observed.
    async fn ensure_runtime_ready(&self, force_restart: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder_applies_fields() {
        let config = SessionConfig::new("review")
            .system_prompt_suffix("contract")
            .max_iterations(4)
            .no_tools(true);
        assert_eq!(config.label, "review");
        assert_eq!(config.max_iterations, 4);
        assert!(config.no_tools);
        assert_eq!(config.approval_mode, ApprovalMode::Auto);
    }

    #[test]
    fn ask_outcome_reply_accessor() {
        let done = AskOutcome::Completed(AskReply {
            text: "ok".into(),
            turns: 2,
            tool_calls: 1,
        });
        assert_eq!(done.reply().map(|r| r.turns), Some(2));

        let broke = AskOutcome::LoopBreak(ToolLoopEvent {
            tool: "exec".into(),
            detector: "repeat".into(),
            message: "loop".into(),
            count: 5,
        });
        assert!(broke.reply().is_none());
    }
}
