//! The run controller and its supporting machinery.

pub mod attempt;
pub mod lock;
pub mod preflight;
pub mod retry;
pub mod rollback;
pub mod runner;
pub mod state;
pub mod summary;

pub use attempt::{ATTEMPT_TOKEN_BUDGET_EXCEEDED, PROMPT_BUDGET_EXCEEDED};
pub use lock::AntonLock;
pub use preflight::PreflightOutcome;
pub use runner::RunController;
pub use state::{AttemptRecord, AttemptStatus, PreflightRecord, PreflightStage, PreflightStatus, RunState};
pub use summary::{RunSummary, StopReason};
