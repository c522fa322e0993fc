//! Error taxonomy for the orchestrator
//!
//! Fatal errors (invalid configuration, missing artifacts, rounds with zero
//! surviving jobs, empty combination windows) propagate to the driver, which
//! emits a best-effort operator notification and exits non-zero. Seed
//! mismatches and probe failures are warnings, not errors; they are logged at
//! the point where they occur and execution continues.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the orchestration stages
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid parameters detected before the iteration loop starts
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An expected model artifact is absent or empty after a stage
    #[error("missing or empty artifact {path}: {reason}")]
    MissingArtifact { path: PathBuf, reason: String },

    /// An individual job failed within a round; recorded in the manifest and
    /// recovered at round granularity unless no jobs survive
    #[error("job {job_id} of iteration {iteration} failed: {reason}")]
    WorkerFailure {
        iteration: u32,
        job_id: u32,
        reason: String,
    },

    /// Every job of a round failed
    #[error("all {job_count} jobs of iteration {iteration} failed")]
    NoSurvivingJobs { iteration: u32, job_count: u32 },

    /// The combination window contained no readable candidate models
    #[error("no candidate models available for final combination")]
    NoCandidates,
}
