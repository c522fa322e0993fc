//! Final model combination
//!
//! Terminal stage of a run: takes a window of recent round models and solves
//! for per-model interpolation weights to produce a single best final model,
//! then scores it on the same held-out subset the per-round probes use, so
//! the final number is directly comparable to the training-time ones.
//!
//! Candidates are passed to the engine freshest-first: running statistics
//! that are not part of the optimized parameter set are taken from the first
//! candidate, and the freshest statistics must lead.

use crate::config::CombinationConfig;
use crate::engine::{CombineOptions, ComputeEngine, ConstraintMode, DataSubset};
use crate::error::OrchestratorError;
use crate::Result;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Optimizer iterations in hard-constraint mode
const HARD_CONSTRAINT_ITERS: u32 = 20;
/// Optimizer iterations in soft-penalty mode; the unconstrained search space
/// is larger, so the optimizer gets more of them
const PENALTY_ITERS: u32 = 80;

/// Iteration indices eligible for final combination, freshest first
///
/// The window covers the last `max_models` rounds and always includes the
/// last trained iteration.
pub fn combination_window(last_iteration: u32, max_models: u32) -> Vec<u32> {
    let first = last_iteration.saturating_sub(max_models - 1).max(1);
    (first..=last_iteration).rev().collect()
}

/// Terminal combination stage
pub struct CombinationStage {
    engine: Arc<dyn ComputeEngine>,
    run_dir: PathBuf,
}

impl CombinationStage {
    pub fn new(engine: Arc<dyn ComputeEngine>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            run_dir: run_dir.into(),
        }
    }

    /// Combine the window's round models into the terminal artifact and
    /// return its path plus the held-out validation objective.
    ///
    /// Missing candidates are warned about and skipped; the stage fails only
    /// when no candidate remains.
    pub fn combine(&self, window: &[u32], config: &CombinationConfig) -> Result<(PathBuf, f64)> {
        let mut candidates = Vec::with_capacity(window.len());
        for &iteration in window {
            let path = self.run_dir.join(format!("model.{}", iteration));
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size > 0 {
                candidates.push(path);
            } else {
                warn!(
                    "model {} does not exist (final combination); skipping",
                    path.display()
                );
            }
        }
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates.into());
        }

        let options = combine_options(config.sum_to_one_penalty);
        info!(
            "combining {} models ({})",
            candidates.len(),
            match options.constraint {
                ConstraintMode::SumToOne => "hard sum-to-one constraint".to_string(),
                ConstraintMode::Penalty(p) => format!("sum-to-one penalty {}", p),
            }
        );

        let output = self.run_dir.join("model.final");
        let report =
            self.engine
                .combine_models(&candidates, DataSubset::Combine, &options, &output)?;
        info!(
            "combination weights: {:?} (sum {:.6})",
            report.weights,
            report.weight_sum()
        );

        let size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(OrchestratorError::MissingArtifact {
                path: output,
                reason: "final combination produced empty model".into(),
            }
            .into());
        }

        // Score on the same subset the per-round probes use, so this number
        // is comparable to theirs.
        let objective = self.engine.evaluate_objective(&output, DataSubset::HeldOut)?;
        info!("final model held-out objective: {:.6}", objective);
        Ok((output, objective))
    }
}

/// Derive the combination mode from the penalty strength: non-positive
/// selects the hard constraint, positive selects the soft penalty with
/// independent per-block weight vectors.
fn combine_options(sum_to_one_penalty: f64) -> CombineOptions {
    if sum_to_one_penalty <= 0.0 {
        CombineOptions {
            constraint: ConstraintMode::SumToOne,
            num_iters: HARD_CONSTRAINT_ITERS,
            separate_weights_per_block: false,
        }
    } else {
        CombineOptions {
            constraint: ConstraintMode::Penalty(sum_to_one_penalty),
            num_iters: PENALTY_ITERS,
            separate_weights_per_block: true,
        }
    }
}
