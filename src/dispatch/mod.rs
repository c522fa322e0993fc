//! Worker dispatch
//!
//! Runs one iteration's parallel fan-out: `job_count` independent training
//! tasks, a barrier join, and an explicit manifest of what each job produced.
//! Downstream stages consume the manifest only; nothing re-derives round
//! state by scanning the run directory.
//!
//! # Concurrency
//!
//! Each job is a blocking compute-engine invocation spawned onto a tokio
//! `JoinSet`. Sibling jobs share no mutable state; the only cross-job
//! artifact is the optimizer cache, which exactly one designated job (job 1)
//! writes for the next round. A task fault (panic) cancels the round's
//! outstanding tasks and aborts the run; an ordinary job error is recorded
//! in the manifest and the round proceeds with the survivors, failing only
//! when no job survives.

use crate::config::RunConfig;
use crate::engine::{ComputeEngine, Hyperparams, TrainOutcome, TrainRequest};
use crate::error::OrchestratorError;
use crate::scheduler;
use crate::state::CacheHandoff;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Outcome of one job within a round
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: u32,
    pub archive_index: u32,
    pub phase_shift: u32,
    /// Explicit training-subset label attached at dispatch time
    pub subset: Option<String>,
    /// Where the job's raw model artifact was (to be) written
    pub output: PathBuf,
    /// True iff the engine call succeeded and the artifact is non-empty
    pub succeeded: bool,
    /// Training objective reported by the engine (best-of-N proxy)
    pub objective: Option<f64>,
    /// Failure reason for unsuccessful jobs
    pub error: Option<String>,
}

/// Explicit record of one round's dispatch, returned by `run_iteration`
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub iteration: u32,
    pub generated_at: DateTime<Utc>,
    pub jobs: Vec<JobOutcome>,
}

impl Manifest {
    /// Jobs whose artifacts may enter aggregation
    pub fn successful(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| j.succeeded)
    }

    pub fn num_successful(&self) -> usize {
        self.successful().count()
    }
}

/// Effective auxiliary training scale for an iteration: linear warm-up from
/// 0 to `target` over `warmup_iterations`, then held constant
pub fn effective_aux_scale(iteration: u32, target: f64, warmup_iterations: u32) -> f64 {
    if warmup_iterations == 0 || iteration >= warmup_iterations {
        target
    } else {
        target * f64::from(iteration) / f64::from(warmup_iterations)
    }
}

/// Effective hyperparameters for every job of one iteration
///
/// Iteration 0 trains with a halved minibatch and `max_param_change / sqrt(2)`:
/// no averaging smooths the noise on the very first round, so the update is
/// kept deliberately small.
pub fn hyperparams_for(config: &RunConfig, iteration: u32, seed: i64) -> Hyperparams {
    let t = &config.training;
    let (minibatch_size, max_param_change) = if iteration == 0 {
        ((t.minibatch_size / 2).max(1), t.max_param_change / 2f64.sqrt())
    } else {
        (t.minibatch_size, t.max_param_change)
    };
    Hyperparams {
        learning_rate: config.learning_rate_for(iteration),
        shrinkage: config.schedule.shrinkage,
        minibatch_size,
        max_param_change,
        momentum: t.momentum,
        l2_regularize: t.l2_regularize,
        aux_scale: effective_aux_scale(iteration, t.aux_scale_target, t.aux_warmup_iterations),
        seed: seed + i64::from(iteration),
    }
}

/// Launches and joins the parallel jobs of one iteration
pub struct WorkerDispatcher {
    engine: Arc<dyn ComputeEngine>,
    config: Arc<RunConfig>,
}

impl WorkerDispatcher {
    pub fn new(engine: Arc<dyn ComputeEngine>, config: Arc<RunConfig>) -> Self {
        Self { engine, config }
    }

    /// Run one round: spawn `job_count` tasks, block until every task has
    /// finished, and return the manifest.
    ///
    /// # Errors
    ///
    /// Fatal when the round's input model is missing or empty, when a task
    /// faults (panics), or when zero jobs succeed.
    pub async fn run_iteration(
        &self,
        iteration: u32,
        processed_count: u64,
        seed: i64,
        cache: &CacheHandoff,
    ) -> Result<Manifest> {
        let config = &self.config;
        let job_count = config.job_count_for(iteration);
        let input_model = config.model_path(iteration);
        let input_size = fs::metadata(&input_model).map(|m| m.len()).unwrap_or(0);
        if input_size == 0 {
            return Err(OrchestratorError::MissingArtifact {
                path: input_model,
                reason: format!("input model for iteration {} is missing or empty", iteration),
            }
            .into());
        }

        let hyperparams = hyperparams_for(config, iteration, seed);
        let cache_in = cache.read_slot(iteration);
        // Job 1 writes the cache for the next round, unless the next round
        // is past the end of training.
        let cache_out = if iteration + 1 < config.num_iterations {
            Some(cache.claim_writer(iteration + 1)?)
        } else {
            None
        };

        info!(
            "iteration {}: dispatching {} jobs (lrate {:.6}, {} archives processed)",
            iteration, job_count, hyperparams.learning_rate, processed_count
        );

        struct PendingJob {
            job_id: u32,
            archive_index: u32,
            phase_shift: u32,
            subset: Option<String>,
            output: PathBuf,
        }

        let mut pending = Vec::with_capacity(job_count as usize);
        let mut tasks: JoinSet<(u32, Result<TrainOutcome>)> = JoinSet::new();
        for job_id in 1..=job_count {
            let assignment =
                scheduler::assign(processed_count, job_id, config.num_archives, config.subsampling_factor);
            let output = config.raw_model_path(iteration + 1, job_id);
            pending.push(PendingJob {
                job_id,
                archive_index: assignment.archive_index,
                phase_shift: assignment.phase_shift,
                subset: config
                    .subset_for_archive(assignment.archive_index)
                    .map(str::to_owned),
                output: output.clone(),
            });

            let request = TrainRequest {
                model: input_model.clone(),
                archive_index: assignment.archive_index,
                phase_shift: assignment.phase_shift,
                hyperparams: hyperparams.clone(),
                cache_in: cache_in.clone(),
                cache_out: if job_id == 1 { cache_out.clone() } else { None },
                output,
            };
            let engine = Arc::clone(&self.engine);
            tasks.spawn_blocking(move || (job_id, engine.train_step(&request)));
        }

        // Barrier join: the round is not over until every task has finished.
        let mut results: HashMap<u32, Result<TrainOutcome>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job_id, result)) => {
                    results.insert(job_id, result);
                }
                Err(fault) => {
                    // An uncaught fault in a worker task aborts the run;
                    // cancel everything still outstanding in this round.
                    tasks.shutdown().await;
                    return Err(anyhow::anyhow!(
                        "worker task fault in iteration {}: {}",
                        iteration,
                        fault
                    ));
                }
            }
        }

        let mut jobs = Vec::with_capacity(pending.len());
        for job in pending {
            let outcome = match results.remove(&job.job_id) {
                Some(Ok(outcome)) => {
                    let size = fs::metadata(&job.output).map(|m| m.len()).unwrap_or(0);
                    if size > 0 {
                        JobOutcome {
                            job_id: job.job_id,
                            archive_index: job.archive_index,
                            phase_shift: job.phase_shift,
                            subset: job.subset,
                            output: job.output,
                            succeeded: true,
                            objective: Some(outcome.objective),
                            error: None,
                        }
                    } else {
                        let failure = OrchestratorError::WorkerFailure {
                            iteration,
                            job_id: job.job_id,
                            reason: "output artifact missing or empty".into(),
                        };
                        warn!("{}", failure);
                        JobOutcome {
                            job_id: job.job_id,
                            archive_index: job.archive_index,
                            phase_shift: job.phase_shift,
                            subset: job.subset,
                            output: job.output,
                            succeeded: false,
                            objective: None,
                            error: Some("output artifact missing or empty".into()),
                        }
                    }
                }
                Some(Err(err)) => {
                    let reason = format!("{:#}", err);
                    let failure = OrchestratorError::WorkerFailure {
                        iteration,
                        job_id: job.job_id,
                        reason: reason.clone(),
                    };
                    warn!("{}", failure);
                    JobOutcome {
                        job_id: job.job_id,
                        archive_index: job.archive_index,
                        phase_shift: job.phase_shift,
                        subset: job.subset,
                        output: job.output,
                        succeeded: false,
                        objective: None,
                        error: Some(reason),
                    }
                }
                None => unreachable!("every spawned job reports exactly once"),
            };
            jobs.push(outcome);
        }
        jobs.sort_by_key(|j| j.job_id);

        let manifest = Manifest {
            iteration,
            generated_at: Utc::now(),
            jobs,
        };

        if manifest.num_successful() == 0 {
            error!("iteration {}: all {} jobs failed", iteration, job_count);
            return Err(OrchestratorError::NoSurvivingJobs {
                iteration,
                job_count,
            }
            .into());
        }
        if manifest.num_successful() < job_count as usize {
            warn!(
                "iteration {}: proceeding with {} of {} jobs",
                iteration,
                manifest.num_successful(),
                job_count
            );
        }

        self.write_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Overwrite the operator-facing manifest file. The in-memory manifest
    /// stays authoritative; this copy is never read back.
    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.config.run_dir.join("manifest.json");
        let contents =
            serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }
}
