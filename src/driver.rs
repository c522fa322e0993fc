//! Iteration loop driver
//!
//! Glues the stages together: for each round it dispatches the parallel
//! jobs, aggregates the survivors into the round model, fires the monitoring
//! probes, retires the consumed cache, and advances the processed-archive
//! counter; after the last round it runs the terminal combination. The loop
//! is strictly sequential: round i+1 is never dispatched before round i has
//! joined every job and produced a valid model. Only probe tasks overlap
//! the next round.
//!
//! Fatal errors propagate here; the driver logs them, emits a best-effort
//! operator notification, and returns the error so the process exits
//! non-zero. Outstanding probes are drained before returning on both the
//! success and the failure path.

use crate::aggregate::{AggregationMode, ModelAggregator};
use crate::combine::{combination_window, CombinationStage};
use crate::config::{validator, RunConfig};
use crate::dispatch::WorkerDispatcher;
use crate::engine::{ComputeEngine, DataSubset};
use crate::error::OrchestratorError;
use crate::probe::ProbeSet;
use crate::state::{CacheHandoff, ProgressGuard};
use crate::Result;
use log::{error, info};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Best-effort channel for surfacing fatal failures to an operator
pub trait FailureNotifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Default notifier: routes the notification to the error log
pub struct LogNotifier;

impl FailureNotifier for LogNotifier {
    fn notify(&self, message: &str) {
        error!("operator notification: {}", message);
    }
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub final_model: PathBuf,
    /// Held-out objective of the final combined model, comparable to the
    /// per-round probe values
    pub validation_objective: f64,
    pub iterations_completed: u32,
}

/// Drives a complete training run against one run directory
///
/// The run directory is exclusive to this instance; running two
/// orchestrators against the same directory is unsupported.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    engine: Arc<dyn ComputeEngine>,
    notifier: Box<dyn FailureNotifier>,
}

impl Orchestrator {
    /// Create an orchestrator, validating the configuration up front.
    /// Validation failures are ConfigurationErrors; no state is created.
    pub fn new(config: RunConfig, engine: Arc<dyn ComputeEngine>) -> Result<Self> {
        validator::validate_config(&config)?;
        Ok(Self {
            config: Arc::new(config),
            engine,
            notifier: Box::new(LogNotifier),
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run the full training loop plus the terminal combination.
    ///
    /// All outstanding probes are drained before this returns, so probe
    /// failures are observable before process exit.
    pub async fn run(&self) -> Result<TrainingReport> {
        let mut probes = ProbeSet::new();
        let result = self.run_inner(&mut probes).await;
        probes.drain().await;
        match result {
            Ok(report) => {
                info!(
                    "training complete: {} iterations, final objective {:.6}",
                    report.iterations_completed, report.validation_objective
                );
                Ok(report)
            }
            Err(err) => {
                error!("training run failed: {:#}", err);
                self.notifier
                    .notify(&format!("training run failed: {:#}", err));
                Err(err)
            }
        }
    }

    async fn run_inner(&self, probes: &mut ProbeSet) -> Result<TrainingReport> {
        let config = &self.config;
        let guard = ProgressGuard::new(&config.run_dir);
        let seed = guard.check_or_init_seed(config.seed)?;
        guard.init_subsampling_factor(config.subsampling_factor)?;
        let mut processed = guard.archives_processed()?;

        let initial_model = config.model_path(0);
        let initial_size = fs::metadata(&initial_model).map(|m| m.len()).unwrap_or(0);
        if initial_size == 0 {
            return Err(OrchestratorError::MissingArtifact {
                path: initial_model,
                reason: "initial model is missing or empty".into(),
            }
            .into());
        }

        let cache = CacheHandoff::new(&config.run_dir);
        let dispatcher = WorkerDispatcher::new(Arc::clone(&self.engine), Arc::clone(config));
        let aggregator = ModelAggregator::new(Arc::clone(&self.engine));

        for iteration in 0..config.num_iterations {
            let manifest = dispatcher
                .run_iteration(iteration, processed, seed, &cache)
                .await?;

            let round_model = config.model_path(iteration + 1);
            aggregator.aggregate(&manifest, &self.aggregation_mode_for(iteration), &round_model)?;

            // Monitoring only; the next round does not wait for these.
            probes.fire(
                Arc::clone(&self.engine),
                round_model.clone(),
                DataSubset::HeldOut,
                iteration + 1,
            );
            probes.fire(
                Arc::clone(&self.engine),
                round_model,
                DataSubset::TrainSample,
                iteration + 1,
            );

            cache.retire(iteration)?;
            processed = guard.advance(manifest.jobs.len() as u32)?;
        }

        let stage = CombinationStage::new(Arc::clone(&self.engine), &config.run_dir);
        let window =
            combination_window(config.num_iterations, config.combination.max_models_combine);
        let (final_model, validation_objective) = stage.combine(&window, &config.combination)?;

        Ok(TrainingReport {
            final_model,
            validation_objective,
            iterations_completed: config.num_iterations,
        })
    }

    /// Iteration 0 selects the best single job (its `do_average` flag is
    /// false); later rounds average, weighted by subset when subsets are
    /// configured.
    fn aggregation_mode_for(&self, iteration: u32) -> AggregationMode {
        if iteration == 0 {
            AggregationMode::BestOfN
        } else if let Some(subsets) = &self.config.subsets {
            AggregationMode::SubsetWeighted(subsets.weights.clone())
        } else {
            AggregationMode::UniformAverage
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CombinationConfig, JobConfig, ScheduleConfig, SubsetConfig, TrainingConfig};
    use crate::engine::mock::{MockEngine, VectorModel};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, num_iterations: u32, jobs: u32) -> RunConfig {
        RunConfig {
            run_dir: dir.path().to_path_buf(),
            num_iterations,
            num_archives: 4,
            subsampling_factor: 3,
            seed: 17,
            jobs: JobConfig {
                num_jobs_initial: jobs,
                num_jobs_final: jobs,
            },
            schedule: ScheduleConfig {
                initial_effective_lrate: 0.4,
                final_effective_lrate: 0.1,
                shrinkage: 1.0,
            },
            training: TrainingConfig::default(),
            subsets: None,
            combination: CombinationConfig::default(),
        }
    }

    fn seeded_engine(dir: &TempDir) -> Arc<MockEngine> {
        let engine = Arc::new(MockEngine::new(vec![1.0, -1.0]).with_objective_noise(0.001));
        MockEngine::seed_model(&dir.path().join("model.0"), vec![0.0, 0.0]).unwrap();
        engine
    }

    struct RecordingNotifier(Mutex<Vec<String>>);

    impl FailureNotifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn full_run_trains_combines_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_engine(&dir);
        let orchestrator = Orchestrator::new(test_config(&dir, 3, 4), engine.clone()).unwrap();

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.iterations_completed, 3);
        assert!(report.final_model.exists());
        assert!(report.validation_objective.is_finite());

        // Round models exist; transient artifacts do not.
        for iter in 1..=3u32 {
            assert!(dir.path().join(format!("model.{}", iter)).exists());
        }
        for iter in 1..=3u32 {
            for job in 1..=4u32 {
                assert!(!dir.path().join(format!("model.{}.{}", iter, job)).exists());
            }
            assert!(!dir.path().join(format!("cache.{}", iter)).exists());
        }

        // The final model improves on the cold start at squared distance 1.
        assert!(report.validation_objective > -1.0);

        // State records: seed persisted, counter advanced by 3 rounds of 4.
        let guard = ProgressGuard::new(dir.path());
        assert_eq!(guard.archives_processed().unwrap(), 12);
        assert_eq!(guard.check_or_init_seed(17).unwrap(), 17);
    }

    #[tokio::test]
    async fn run_survives_a_consistently_failing_archive() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_engine(&dir);
        engine.set_fail_archives([2]);
        let orchestrator = Orchestrator::new(test_config(&dir, 2, 4), engine).unwrap();

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.iterations_completed, 2);
        assert!(report.final_model.exists());
    }

    #[tokio::test]
    async fn fatal_failure_notifies_the_operator() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_engine(&dir);
        engine.set_fail_all(true);
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        struct Forward(Arc<RecordingNotifier>);
        impl FailureNotifier for Forward {
            fn notify(&self, message: &str) {
                self.0.notify(message);
            }
        }
        let orchestrator = Orchestrator::new(test_config(&dir, 2, 4), engine)
            .unwrap()
            .with_notifier(Box::new(Forward(notifier.clone())));

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::NoSurvivingJobs { .. })
        ));
        let messages = notifier.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("failed"));
        // The failed round left no model behind.
        assert!(!dir.path().join("model.1").exists());
    }

    #[tokio::test]
    async fn subset_weighted_rounds_use_configured_weights() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_engine(&dir);
        let mut config = test_config(&dir, 2, 4);
        config.subsets = Some(SubsetConfig {
            archive_subsets: vec!["a".into(), "a".into(), "b".into(), "b".into()],
            weights: HashMap::from([("a".to_string(), 0.75), ("b".to_string(), 0.25)]),
        });
        let orchestrator = Orchestrator::new(config, engine).unwrap();

        let report = orchestrator.run().await.unwrap();
        assert!(report.final_model.exists());
        let combined = VectorModel::load(&report.final_model).unwrap();
        assert_eq!(combined.params.len(), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_any_state_exists() {
        let dir = TempDir::new().unwrap();
        let engine: Arc<MockEngine> = Arc::new(MockEngine::new(vec![1.0]));
        let mut config = test_config(&dir, 2, 4);
        config.jobs.num_jobs_initial = 9; // exceeds num_jobs_final

        assert!(Orchestrator::new(config, engine).is_err());
        assert!(!dir.path().join("seed").exists());
    }

    #[tokio::test]
    async fn missing_initial_model_is_fatal() {
        let dir = TempDir::new().unwrap();
        let engine: Arc<MockEngine> = Arc::new(MockEngine::new(vec![1.0, -1.0]));
        let orchestrator = Orchestrator::new(test_config(&dir, 2, 2), engine).unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::MissingArtifact { .. })
        ));
    }
}
