//! Run configuration
//!
//! Typed configuration for one orchestrator run. Configurations are built in
//! code or loaded from a TOML file (`toml` submodule) and must pass the
//! `validator` before the iteration loop starts; validation failures are
//! ConfigurationErrors and create no partial state.

pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Complete configuration for one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run directory holding all artifacts and state records; exclusive to
    /// one orchestrator instance
    pub run_dir: PathBuf,

    /// Number of training iterations (rounds)
    pub num_iterations: u32,

    /// Fixed archive (data shard) count for the run
    pub num_archives: u32,

    /// Phase-subsampling factor; recorded once at initialization
    #[serde(default = "default_subsampling_factor")]
    pub subsampling_factor: u32,

    /// Per-run random seed
    #[serde(default)]
    pub seed: i64,

    #[serde(default)]
    pub jobs: JobConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    /// Optional training-subset tagging; when present, rounds after the
    /// first aggregate with subset-weighted averaging
    #[serde(default)]
    pub subsets: Option<SubsetConfig>,

    #[serde(default)]
    pub combination: CombinationConfig,
}

/// Parallel job-count bounds
///
/// The per-round job count ramps linearly from `num_jobs_initial` on the
/// first iteration to `num_jobs_final` on the last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub num_jobs_initial: u32,
    pub num_jobs_final: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        let n = num_cpus::get() as u32;
        Self {
            num_jobs_initial: n,
            num_jobs_final: n,
        }
    }
}

/// Learning-rate schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub initial_effective_lrate: f64,
    pub final_effective_lrate: f64,
    /// Parameter shrinkage applied when jobs read the round's input model
    pub shrinkage: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            initial_effective_lrate: 0.001,
            final_effective_lrate: 0.0001,
            shrinkage: 1.0,
        }
    }
}

/// Hyperparameters shared by every training step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub minibatch_size: u32,
    pub max_param_change: f64,
    pub momentum: f64,
    pub l2_regularize: f64,
    /// Target value of the auxiliary training-scale term
    pub aux_scale_target: f64,
    /// Warm-up window over which the auxiliary scale ramps from 0 to target
    pub aux_warmup_iterations: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            minibatch_size: 128,
            max_param_change: 2.0,
            momentum: 0.0,
            l2_regularize: 0.0,
            aux_scale_target: 0.0,
            aux_warmup_iterations: 15,
        }
    }
}

/// Explicit training-subset identity for archives
///
/// `archive_subsets[i]` is the subset label of archive `i + 1`; `weights`
/// supplies one aggregation weight per label. Weights are not required to
/// sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsetConfig {
    pub archive_subsets: Vec<String>,
    pub weights: HashMap<String, f64>,
}

/// Terminal combination stage options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationConfig {
    /// Window size: the last `max_models_combine` round models are candidates
    pub max_models_combine: u32,
    /// <= 0 selects hard sum-to-one constraint mode; > 0 selects soft-penalty
    /// mode with this penalty strength
    pub sum_to_one_penalty: f64,
}

impl Default for CombinationConfig {
    fn default() -> Self {
        Self {
            max_models_combine: 20,
            sum_to_one_penalty: 0.0,
        }
    }
}

fn default_subsampling_factor() -> u32 {
    3
}

impl RunConfig {
    /// Job count for one iteration: rounded linear interpolation between the
    /// configured bounds across the run
    pub fn job_count_for(&self, iteration: u32) -> u32 {
        let initial = f64::from(self.jobs.num_jobs_initial);
        let final_ = f64::from(self.jobs.num_jobs_final);
        if self.num_iterations <= 1 {
            return self.jobs.num_jobs_final;
        }
        let frac = f64::from(iteration) / f64::from(self.num_iterations - 1);
        let count = initial + (final_ - initial) * frac;
        (count.round() as u32).clamp(
            self.jobs.num_jobs_initial.min(self.jobs.num_jobs_final),
            self.jobs.num_jobs_initial.max(self.jobs.num_jobs_final),
        )
    }

    /// Effective learning rate for one iteration: exponential interpolation
    /// from the initial to the final rate
    pub fn learning_rate_for(&self, iteration: u32) -> f64 {
        let initial = self.schedule.initial_effective_lrate;
        let final_ = self.schedule.final_effective_lrate;
        if self.num_iterations <= 1 {
            return final_;
        }
        let frac = f64::from(iteration) / f64::from(self.num_iterations - 1);
        initial * (final_ / initial).powf(frac)
    }

    /// Subset label for a 1-based archive index, when subsets are configured
    pub fn subset_for_archive(&self, archive_index: u32) -> Option<&str> {
        self.subsets
            .as_ref()
            .and_then(|s| s.archive_subsets.get(archive_index as usize - 1))
            .map(String::as_str)
    }

    /// Path of the aggregated model produced by (or consumed at) iteration
    /// boundary `iteration`
    pub fn model_path(&self, iteration: u32) -> PathBuf {
        self.run_dir.join(format!("model.{}", iteration))
    }

    /// Path of one job's transient raw artifact
    pub fn raw_model_path(&self, next_iteration: u32, job_id: u32) -> PathBuf {
        self.run_dir
            .join(format!("model.{}.{}", next_iteration, job_id))
    }

    /// Path of the terminal combined model
    pub fn final_model_path(&self) -> PathBuf {
        self.run_dir.join("model.final")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            run_dir: PathBuf::from("/tmp/run"),
            num_iterations: 11,
            num_archives: 8,
            subsampling_factor: 3,
            seed: 7,
            jobs: JobConfig {
                num_jobs_initial: 2,
                num_jobs_final: 6,
            },
            schedule: ScheduleConfig::default(),
            training: TrainingConfig::default(),
            subsets: None,
            combination: CombinationConfig::default(),
        }
    }

    #[test]
    fn job_count_ramps_between_bounds() {
        let cfg = config();
        assert_eq!(cfg.job_count_for(0), 2);
        assert_eq!(cfg.job_count_for(10), 6);
        assert_eq!(cfg.job_count_for(5), 4);
        for iter in 0..11 {
            let n = cfg.job_count_for(iter);
            assert!((2..=6).contains(&n));
        }
    }

    #[test]
    fn single_iteration_uses_final_job_count() {
        let mut cfg = config();
        cfg.num_iterations = 1;
        assert_eq!(cfg.job_count_for(0), 6);
    }

    #[test]
    fn learning_rate_interpolates_endpoints() {
        let cfg = config();
        assert!((cfg.learning_rate_for(0) - 0.001).abs() < 1e-12);
        assert!((cfg.learning_rate_for(10) - 0.0001).abs() < 1e-12);
        // Monotone decreasing.
        for iter in 1..11 {
            assert!(cfg.learning_rate_for(iter) < cfg.learning_rate_for(iter - 1));
        }
    }

    #[test]
    fn subset_lookup_is_one_based() {
        let mut cfg = config();
        cfg.subsets = Some(SubsetConfig {
            archive_subsets: vec!["a".into(), "b".into()],
            weights: HashMap::new(),
        });
        cfg.num_archives = 2;
        assert_eq!(cfg.subset_for_archive(1), Some("a"));
        assert_eq!(cfg.subset_for_archive(2), Some("b"));
        assert_eq!(cfg.subset_for_archive(3), None);
    }
}
