//! Critic - difference engine for code review
//!
//! This library computes and caches what changed between two commits of a
//! git repository: changed files, line-level blocks, intra-line alignment of
//! modified lines and syntax highlighting of every file version involved.
//! A job runner schedules the work, workers serve it in-process or behind a
//! pub/sub broker, and review branches get their changesets requested and
//! summarised as they move.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod jobs;
pub mod pubsub;
pub mod repo;
pub mod review;
pub mod runner;
pub mod storage;
pub mod worker;

/// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{FailureKind, JobFailure};
pub use repo::Repository;
pub use runner::{JobRunner, RunnerStats};
pub use storage::Database;

/// Application-wide error type
pub use anyhow::Result;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "critic";
