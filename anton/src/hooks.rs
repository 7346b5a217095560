//! Run-level lifecycle hooks.
//!
//! Front-ends observe a run through [`RunHooks`]: an object-safe async
//! trait with a default no-op implementation for every event, so listeners
//! override only what they care about.

use async_trait::async_trait;

use crate::context::CompactionStats;
use crate::controller::state::{AttemptRecord, PreflightRecord};
use crate::controller::summary::RunSummary;
use crate::session::ToolLoopEvent;
use crate::taskfile::Task;

/// A shared, thread-safe [`RunHooks`] trait object.
pub type SharedRunHooks = std::sync::Arc<dyn RunHooks>;

/// Lifecycle events emitted by the run controller.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// A task is about to start its next attempt.
    async fn on_task_start(&self, _task: &Task, _attempt: u32) {}

    /// An attempt finished.
    async fn on_task_end(&self, _task: &Task, _record: &AttemptRecord) {}

    /// A preflight stage finished.
    async fn on_preflight(&self, _task: &Task, _record: &PreflightRecord) {}

    /// The lock heartbeat fired.
    async fn on_heartbeat(&self) {}

    /// A tool loop was detected inside a session.
    async fn on_tool_loop(&self, _event: &ToolLoopEvent) {}

    /// A history compaction ran inside a session.
    async fn on_compaction(&self, _stats: &CompactionStats) {}

    /// The run finished.
    async fn on_run_end(&self, _summary: &RunSummary) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunHooks;

#[async_trait]
impl RunHooks for NoopRunHooks {}
