//! Anton is an autonomous coding-task supervisor: given a markdown task
//! list and a working git repository, it drives an external language-model
//! agent through plan → implement → verify → commit cycles until every
//! task is checked off, a budget is exhausted, or an unrecoverable block
//! is reached.
//!
//! The crate is the orchestration kernel. Model transport, tool
//! implementations, chat front-ends, and the note store are external
//! collaborators consumed through the narrow traits in [`session`],
//! [`git`], and [`vault`].
//!
//! # Subsystems
//!
//! - [`taskfile`]: hierarchical checklist parsing and mutation
//! - [`controller`]: the run state machine: lock, budgets, preflight,
//!   attempts, rollback
//! - [`context`]: token-aware history compaction
//! - [`loopdetect`]: hashed-signature guard against runaway tool loops
//! - [`verify`]: build/test/lint gates plus the AI review

// Core data model
pub mod error;
pub mod message;
pub mod usage;

// External seams
pub mod git;
pub mod hooks;
pub mod session;
pub mod vault;

// Subsystems
pub mod config;
pub mod context;
pub mod contract;
pub mod controller;
pub mod loopdetect;
pub mod prompts;
pub mod taskfile;
pub mod verify;

// Re-export the types almost every embedder needs.
pub use config::RunConfig;
pub use controller::{RunController, RunSummary, StopReason};
pub use error::{Error, Result};
pub use taskfile::{Task, TaskFile, TaskKey};
