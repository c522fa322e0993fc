//! Compute engine abstraction
//!
//! This module defines the boundary between the orchestrator and the numerical
//! training system. The orchestrator never looks inside a model artifact: it
//! schedules work, moves files, and sequences rounds, while every numerical
//! operation goes through the `ComputeEngine` trait. This keeps the
//! orchestration logic agnostic to the model representation and allows tests
//! to run against an in-memory mock engine.
//!
//! # Capabilities
//!
//! The engine exposes exactly four operations:
//!
//! - **train_step**: one parallel-job invocation; reads a model and a data
//!   archive, writes a new model artifact (and optionally an optimizer cache)
//! - **merge_models**: elementwise parameter combination, optionally weighted
//! - **combine_models**: numeric-optimization-based interpolation of several
//!   candidate models into one
//! - **evaluate_objective**: scalar validation/training objective used for
//!   monitoring and for first-round best-of-N selection

pub mod mock;

use crate::Result;
use std::path::{Path, PathBuf};

/// Data subset an evaluation or combination runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSubset {
    /// Held-out validation subset
    HeldOut,
    /// Random sample of the training data, for train-objective monitoring
    TrainSample,
    /// Subset reserved for the final combination's optimization
    Combine,
}

/// Hyperparameters for one training-step invocation
///
/// These are the per-job effective values: the dispatcher has already applied
/// the learning-rate schedule, the warm-up ramp, and the iteration-0
/// overrides before constructing this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparams {
    pub learning_rate: f64,
    /// Parameter shrinkage applied when reading the input model
    pub shrinkage: f64,
    pub minibatch_size: u32,
    pub max_param_change: f64,
    pub momentum: f64,
    pub l2_regularize: f64,
    /// Auxiliary training-scale term, linearly ramped over early iterations
    pub aux_scale: f64,
    /// Per-iteration random seed (run seed + iteration index)
    pub seed: i64,
}

/// One job's training-step request
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Input model artifact (the previous round's aggregated model)
    pub model: PathBuf,
    /// 1-based archive index assigned by the scheduler
    pub archive_index: u32,
    /// Phase shift applied to the archive's alignment
    pub phase_shift: u32,
    pub hyperparams: Hyperparams,
    /// Previous round's optimizer cache, absent on a cold start
    pub cache_in: Option<PathBuf>,
    /// Cache slot to populate for the next round (designated writer only)
    pub cache_out: Option<PathBuf>,
    /// Where the job's raw model artifact must be written
    pub output: PathBuf,
}

/// Result of a successful training step
#[derive(Debug, Clone, Copy)]
pub struct TrainOutcome {
    /// Training objective achieved by this job, used as the validation proxy
    /// for first-round best-of-N selection
    pub objective: f64,
}

/// How interpolation weights are constrained during combination
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstraintMode {
    /// Weights forced to sum to exactly 1
    SumToOne,
    /// Weights driven toward summing to 1 by a penalty of this strength
    Penalty(f64),
}

/// Options for `combine_models`
#[derive(Debug, Clone, Copy)]
pub struct CombineOptions {
    pub constraint: ConstraintMode,
    /// Optimizer iteration count; the unconstrained search space is larger,
    /// so penalty mode uses more iterations than hard-constraint mode
    pub num_iters: u32,
    /// Solve an independent weight vector per parameter block instead of one
    /// global vector (penalty mode only)
    pub separate_weights_per_block: bool,
}

/// Diagnostics returned by `combine_models`
///
/// Weights are non-negative and ordered like the candidate list (freshest
/// first). With per-block weights, this reports the first block's vector.
#[derive(Debug, Clone)]
pub struct CombineReport {
    pub weights: Vec<f64>,
}

impl CombineReport {
    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().sum()
    }
}

/// The opaque numerical training system the orchestrator drives
///
/// Implementations must be safe to share across the round's parallel job
/// tasks (`Send + Sync`); the orchestrator invokes `train_step` from
/// `job_count` tasks concurrently, with no shared mutable state between jobs
/// other than the cache artifact named in the request.
///
/// # Error handling
///
/// A `train_step` error marks that job failed; the round proceeds with the
/// surviving jobs. Errors from the other three operations are fatal to the
/// stage that issued them.
pub trait ComputeEngine: Send + Sync {
    /// Run one training step: read `req.model`, train on the assigned
    /// archive at the given phase shift, write the new artifact to
    /// `req.output` (and the optimizer cache to `req.cache_out` if set).
    fn train_step(&self, req: &TrainRequest) -> Result<TrainOutcome>;

    /// Elementwise parameter combination of `models` into `output`.
    ///
    /// With `weights = None` the models are averaged uniformly; otherwise
    /// `weights` supplies one coefficient per model (same order) and is not
    /// required to sum to 1.
    fn merge_models(&self, models: &[PathBuf], weights: Option<&[f64]>, output: &Path)
        -> Result<()>;

    /// Solve for an optimal interpolation of `models` (freshest first) into
    /// `output`, optimizing the objective on `subset`.
    ///
    /// Model-internal running statistics that are not part of the optimized
    /// parameter set are taken from the first candidate, so the freshest
    /// model must lead the list.
    fn combine_models(
        &self,
        models: &[PathBuf],
        subset: DataSubset,
        options: &CombineOptions,
        output: &Path,
    ) -> Result<CombineReport>;

    /// Evaluate the scalar objective of `model` on `subset`. Read-only.
    fn evaluate_objective(&self, model: &Path, subset: DataSubset) -> Result<f64>;
}
