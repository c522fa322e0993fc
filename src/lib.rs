//! TrainPulse - Distributed iterative training orchestrator
//!
//! TrainPulse drives multi-round model training over sharded data archives:
//! each round fans a set of parallel jobs out over distinct archives, joins
//! them, reduces the survivors to a single round model, and hands a warm
//! compute cache from one round to the next. After the last round it solves
//! for interpolation weights over the recent round models to produce the
//! final artifact.
//!
//! # Architecture
//!
//! - **Deterministic scheduling**: archive and phase assignment is a pure
//!   function of global progress, so runs are reproducible and resumable
//! - **Pluggable compute**: the actual training math lives behind the
//!   [`ComputeEngine`] trait; the orchestrator only moves artifacts
//! - **Fault containment**: individual job failures cost one archive pass,
//!   a round with zero survivors aborts the run
//! - **Background probes**: per-round validation runs detached and never
//!   blocks the loop

pub mod aggregate;
pub mod combine;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod probe;
pub mod scheduler;
pub mod state;

// Re-export commonly used types
pub use config::RunConfig;
pub use driver::{Orchestrator, TrainingReport};
pub use engine::ComputeEngine;
pub use error::OrchestratorError;

/// Result type used throughout TrainPulse
pub type Result<T> = anyhow::Result<T>;
