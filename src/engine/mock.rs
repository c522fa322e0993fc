//! Mock compute engine for testing
//!
//! An in-memory implementation of the `ComputeEngine` trait over small
//! JSON-encoded vector models. Training moves parameters toward a fixed
//! target vector, so objectives improve across rounds the way a real model's
//! would, while staying fast and fully deterministic.
//!
//! # Features
//!
//! - Configurable per-archive failure injection
//! - Tracks every training-step invocation for verification
//! - Honors the cache handoff (reads the incoming record, writes one when
//!   designated)
//! - Projected-gradient combination solver supporting both the
//!   hard-sum-to-one and the soft-penalty constraint modes
//! - Deterministic objective noise from a seeded xoshiro RNG

use super::{
    CombineOptions, CombineReport, ComputeEngine, ConstraintMode, DataSubset, Hyperparams,
    TrainOutcome, TrainRequest,
};
use crate::Result;
use anyhow::{bail, Context};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Model artifact format used by the mock engine
///
/// `norm_stats` stands in for running statistics (e.g. normalization
/// accumulators) that are not part of the optimized parameter set: merging
/// and combination never interpolate them, they are carried over from the
/// first (freshest) candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorModel {
    pub params: Vec<f64>,
    pub norm_stats: Vec<f64>,
}

impl VectorModel {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read model {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse model {}", path.display()))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string(self).context("failed to serialize model")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write model {}", path.display()))
    }
}

/// Optimizer cache record passed between rounds
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    steps_seen: u64,
}

/// Record of one training-step invocation, for test verification
#[derive(Debug, Clone)]
pub struct TrainRecord {
    pub archive_index: u32,
    pub phase_shift: u32,
    pub hyperparams: Hyperparams,
    pub had_cache_in: bool,
    pub wrote_cache: bool,
}

/// Mock compute engine over JSON vector models
#[derive(Clone)]
pub struct MockEngine {
    /// Training pulls parameters toward this vector; the objective is the
    /// negated mean squared distance to it
    target: Vec<f64>,

    /// Amplitude of the deterministic noise added to training objectives
    objective_noise: f64,

    /// Archives whose jobs fail with a simulated error
    fail_archives: Arc<Mutex<HashSet<u32>>>,

    /// Fail every training step, regardless of archive
    fail_all: Arc<Mutex<bool>>,

    /// Every training-step invocation, for verification
    records: Arc<Mutex<Vec<TrainRecord>>>,
}

impl MockEngine {
    /// Create a mock engine whose objective is distance to `target`
    pub fn new(target: Vec<f64>) -> Self {
        Self {
            target,
            objective_noise: 0.0,
            fail_archives: Arc::new(Mutex::new(HashSet::new())),
            fail_all: Arc::new(Mutex::new(false)),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add deterministic, seed-derived noise to training objectives so jobs
    /// within a round are distinguishable for best-of-N selection
    pub fn with_objective_noise(mut self, amplitude: f64) -> Self {
        self.objective_noise = amplitude;
        self
    }

    /// Make every job assigned one of `archives` fail
    pub fn set_fail_archives(&self, archives: impl IntoIterator<Item = u32>) {
        let mut set = self.fail_archives.lock().unwrap();
        set.clear();
        set.extend(archives);
    }

    /// Make every training step fail
    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    /// All training-step invocations so far
    pub fn train_records(&self) -> Vec<TrainRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Write an initial model artifact with the given parameters
    pub fn seed_model(path: &Path, params: Vec<f64>) -> Result<()> {
        VectorModel {
            params,
            norm_stats: vec![0.0],
        }
        .store(path)
    }

    fn mean_squared_distance(&self, params: &[f64]) -> Result<f64> {
        if params.len() != self.target.len() {
            bail!(
                "model dimension {} does not match target dimension {}",
                params.len(),
                self.target.len()
            );
        }
        let sum: f64 = params
            .iter()
            .zip(&self.target)
            .map(|(p, t)| (p - t) * (p - t))
            .sum();
        Ok(sum / params.len() as f64)
    }
}

impl ComputeEngine for MockEngine {
    fn train_step(&self, req: &TrainRequest) -> Result<TrainOutcome> {
        if *self.fail_all.lock().unwrap()
            || self.fail_archives.lock().unwrap().contains(&req.archive_index)
        {
            bail!("simulated training failure on archive {}", req.archive_index);
        }

        let mut model = VectorModel::load(&req.model)?;

        if let Some(cache_in) = &req.cache_in {
            let contents = fs::read_to_string(cache_in)
                .with_context(|| format!("failed to read cache {}", cache_in.display()))?;
            let _record: CacheRecord =
                serde_json::from_str(&contents).context("failed to parse optimizer cache")?;
        }

        let hp = &req.hyperparams;
        for p in &mut model.params {
            *p *= hp.shrinkage;
        }

        // One gradient step toward the target, clamped to max_param_change
        // in L2 norm.
        let mut delta: Vec<f64> = model
            .params
            .iter()
            .zip(&self.target)
            .map(|(p, t)| hp.learning_rate * (t - p))
            .collect();
        let norm = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        if norm > hp.max_param_change {
            let scale = hp.max_param_change / norm;
            for d in &mut delta {
                *d *= scale;
            }
        }
        for (p, d) in model.params.iter_mut().zip(&delta) {
            *p += d;
        }

        if model.norm_stats.is_empty() {
            model.norm_stats.push(0.0);
        }
        model.norm_stats[0] += 1.0;

        model.store(&req.output)?;

        if let Some(cache_out) = &req.cache_out {
            let record = CacheRecord {
                steps_seen: model.norm_stats[0] as u64,
            };
            fs::write(cache_out, serde_json::to_string(&record)?)
                .with_context(|| format!("failed to write cache {}", cache_out.display()))?;
        }

        // Noise is derived from the job's identity only, so reruns are
        // bit-identical.
        let noise = if self.objective_noise > 0.0 {
            let seed = (hp.seed as u64)
                .wrapping_mul(31)
                .wrapping_add(u64::from(req.archive_index) << 8)
                .wrapping_add(u64::from(req.phase_shift));
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
            self.objective_noise * (rng.gen::<f64>() - 0.5)
        } else {
            0.0
        };

        self.records.lock().unwrap().push(TrainRecord {
            archive_index: req.archive_index,
            phase_shift: req.phase_shift,
            hyperparams: req.hyperparams.clone(),
            had_cache_in: req.cache_in.is_some(),
            wrote_cache: req.cache_out.is_some(),
        });

        let objective = -self.mean_squared_distance(&model.params)? + noise;
        Ok(TrainOutcome { objective })
    }

    fn merge_models(
        &self,
        models: &[PathBuf],
        weights: Option<&[f64]>,
        output: &Path,
    ) -> Result<()> {
        if models.is_empty() {
            bail!("cannot merge an empty model list");
        }
        let loaded: Vec<VectorModel> = models
            .iter()
            .map(|p| VectorModel::load(p))
            .collect::<Result<_>>()?;
        let dim = loaded[0].params.len();
        if loaded.iter().any(|m| m.params.len() != dim) {
            bail!("cannot merge models of differing dimension");
        }

        let coeffs: Vec<f64> = match weights {
            Some(w) => {
                if w.len() != models.len() {
                    bail!("got {} weights for {} models", w.len(), models.len());
                }
                let sum: f64 = w.iter().sum();
                if sum <= 0.0 {
                    bail!("merge weights must have a positive sum, got {}", sum);
                }
                w.iter().map(|x| x / sum).collect()
            }
            None => vec![1.0 / models.len() as f64; models.len()],
        };

        let mut params = vec![0.0; dim];
        for (model, c) in loaded.iter().zip(&coeffs) {
            for (acc, p) in params.iter_mut().zip(&model.params) {
                *acc += c * p;
            }
        }

        VectorModel {
            params,
            norm_stats: loaded[0].norm_stats.clone(),
        }
        .store(output)
    }

    fn combine_models(
        &self,
        models: &[PathBuf],
        _subset: DataSubset,
        options: &CombineOptions,
        output: &Path,
    ) -> Result<CombineReport> {
        if models.is_empty() {
            bail!("cannot combine an empty model list");
        }
        let loaded: Vec<VectorModel> = models
            .iter()
            .map(|p| VectorModel::load(p))
            .collect::<Result<_>>()?;
        let dim = loaded[0].params.len();
        if loaded.iter().any(|m| m.params.len() != dim) {
            bail!("cannot combine models of differing dimension");
        }
        if dim != self.target.len() {
            bail!("model dimension {} does not match target dimension {}", dim, self.target.len());
        }

        let n = loaded.len();
        let penalty = match options.constraint {
            ConstraintMode::SumToOne => 0.0,
            ConstraintMode::Penalty(p) => p,
        };

        // Projected gradient descent on
        //   f(w) = || sum_i w_i m_i - target ||^2 + penalty * (sum_i w_i - 1)^2
        // with w >= 0, renormalized each step under the hard constraint.
        let mut gram = vec![vec![0.0; n]; n];
        let mut b = vec![0.0; n];
        for i in 0..n {
            for j in 0..n {
                gram[i][j] = dot(&loaded[i].params, &loaded[j].params);
            }
            b[i] = dot(&loaded[i].params, &self.target);
        }
        let row_bound = gram
            .iter()
            .map(|row| row.iter().map(|x| x.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        let step = 1.0 / (2.0 * row_bound + 2.0 * penalty * n as f64 + 1e-9);

        let mut w = vec![1.0 / n as f64; n];
        let hard = matches!(options.constraint, ConstraintMode::SumToOne);
        for _ in 0..options.num_iters * 25 {
            let sum: f64 = w.iter().sum();
            let mut next = w.clone();
            for i in 0..n {
                let mut grad = -2.0 * b[i];
                for j in 0..n {
                    grad += 2.0 * gram[i][j] * w[j];
                }
                grad += 2.0 * penalty * (sum - 1.0);
                next[i] = (w[i] - step * grad).max(0.0);
            }
            if hard {
                let s: f64 = next.iter().sum();
                if s > 1e-12 {
                    for x in &mut next {
                        *x /= s;
                    }
                } else {
                    next = vec![1.0 / n as f64; n];
                }
            }
            w = next;
        }

        let mut params = vec![0.0; dim];
        for (model, c) in loaded.iter().zip(&w) {
            for (acc, p) in params.iter_mut().zip(&model.params) {
                *acc += c * p;
            }
        }

        // Running statistics come from the freshest candidate, which leads
        // the list.
        VectorModel {
            params,
            norm_stats: loaded[0].norm_stats.clone(),
        }
        .store(output)?;

        Ok(CombineReport { weights: w })
    }

    fn evaluate_objective(&self, model: &Path, subset: DataSubset) -> Result<f64> {
        let model = VectorModel::load(model)?;
        let mse = self.mean_squared_distance(&model.params)?;
        // The training sample scores slightly better than held-out data, as
        // it would for a real model.
        Ok(match subset {
            DataSubset::HeldOut | DataSubset::Combine => -mse,
            DataSubset::TrainSample => -0.9 * mse,
        })
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
