//! Round aggregation
//!
//! Reduces one round's successful worker outputs to a single round model.
//! The very first round selects the best single job instead of averaging
//! (averaging is unhelpful while the model is still changing fast); later
//! rounds average uniformly, or by training-subset weight when jobs carry
//! subset labels. Raw per-job artifacts are deleted as soon as the round
//! model exists, so later stages only ever see current-round outputs.

use crate::dispatch::{JobOutcome, Manifest};
use crate::engine::ComputeEngine;
use crate::error::OrchestratorError;
use crate::Result;
use anyhow::Context;
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a round's surviving models are reduced to one
#[derive(Debug, Clone)]
pub enum AggregationMode {
    /// Keep the single model with the best training-objective proxy
    /// (iteration 0, where `do_average` is false)
    BestOfN,
    /// Elementwise uniform average of all surviving models
    UniformAverage,
    /// Weighted average using the supplied per-subset weights; each job's
    /// weight is the weight of its subset label. Weights need not sum to 1.
    SubsetWeighted(HashMap<String, f64>),
}

/// Reduces a round manifest to one model artifact
pub struct ModelAggregator {
    engine: Arc<dyn ComputeEngine>,
}

impl ModelAggregator {
    pub fn new(engine: Arc<dyn ComputeEngine>) -> Self {
        Self { engine }
    }

    /// Produce the round model at `output` from the manifest's surviving
    /// jobs, then delete every per-job raw artifact of the round.
    ///
    /// # Errors
    ///
    /// Fatal when no job survived, when a surviving job carries a subset
    /// label with no configured weight, or when the produced round model is
    /// missing or empty.
    pub fn aggregate(
        &self,
        manifest: &Manifest,
        mode: &AggregationMode,
        output: &Path,
    ) -> Result<()> {
        let survivors: Vec<&JobOutcome> = manifest.successful().collect();
        if survivors.is_empty() {
            return Err(OrchestratorError::NoSurvivingJobs {
                iteration: manifest.iteration,
                job_count: manifest.jobs.len() as u32,
            }
            .into());
        }

        match mode {
            AggregationMode::BestOfN => self.select_best(&survivors, output)?,
            AggregationMode::UniformAverage => {
                let models: Vec<PathBuf> =
                    survivors.iter().map(|j| j.output.clone()).collect();
                info!(
                    "iteration {}: averaging {} models",
                    manifest.iteration,
                    models.len()
                );
                self.engine.merge_models(&models, None, output)?;
            }
            AggregationMode::SubsetWeighted(weights) => {
                let (models, job_weights) = subset_weights(&survivors, weights)?;
                info!(
                    "iteration {}: subset-weighted average of {} models",
                    manifest.iteration,
                    models.len()
                );
                self.engine
                    .merge_models(&models, Some(&job_weights), output)?;
            }
        }

        // Raw per-job artifacts are transient; remove them all, including
        // any left behind by failed jobs.
        for job in &manifest.jobs {
            match fs::remove_file(&job.output) {
                Ok(()) => debug!("deleted raw artifact {}", job.output.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to delete raw artifact {}", job.output.display())
                    })
                }
            }
        }

        let size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(OrchestratorError::MissingArtifact {
                path: output.to_path_buf(),
                reason: format!("iteration {} produced empty model", manifest.iteration),
            }
            .into());
        }
        Ok(())
    }

    fn select_best(&self, survivors: &[&JobOutcome], output: &Path) -> Result<()> {
        let best = survivors
            .iter()
            .filter(|j| j.objective.is_some())
            .max_by(|a, b| {
                a.objective
                    .partial_cmp(&b.objective)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| {
                anyhow::anyhow!("no surviving job reported an objective for best-of-N selection")
            })?;
        info!(
            "selecting model of job {} (objective {:.6})",
            best.job_id,
            best.objective.unwrap_or(f64::NAN)
        );
        fs::copy(&best.output, output).with_context(|| {
            format!(
                "failed to copy best model {} to {}",
                best.output.display(),
                output.display()
            )
        })?;
        Ok(())
    }
}

/// Resolve each surviving job's weight from its subset label.
///
/// A surviving job without a label, or with a label absent from the weight
/// table, is an error: silently dropping such jobs would distort the average
/// without any operator-visible signal.
fn subset_weights(
    survivors: &[&JobOutcome],
    weights: &HashMap<String, f64>,
) -> Result<(Vec<PathBuf>, Vec<f64>)> {
    let mut models = Vec::with_capacity(survivors.len());
    let mut job_weights = Vec::with_capacity(survivors.len());
    for job in survivors {
        let label = job.subset.as_deref().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "job {} has no subset label but subset-weighted aggregation was requested",
                job.job_id
            ))
        })?;
        let weight = weights.get(label).copied().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "no aggregation weight configured for subset '{}' (job {})",
                label, job.job_id
            ))
        })?;
        models.push(job.output.clone());
        job_weights.push(weight);
    }
    Ok((models, job_weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockEngine, VectorModel};
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(dir: &TempDir, job_id: u32, params: Vec<f64>, objective: f64) -> JobOutcome {
        let output = dir.path().join(format!("model.1.{}", job_id));
        MockEngine::seed_model(&output, params).unwrap();
        JobOutcome {
            job_id,
            archive_index: job_id,
            phase_shift: 0,
            subset: None,
            output,
            succeeded: true,
            objective: Some(objective),
            error: None,
        }
    }

    fn manifest(jobs: Vec<JobOutcome>) -> Manifest {
        Manifest {
            iteration: 0,
            generated_at: Utc::now(),
            jobs,
        }
    }

    #[test]
    fn best_of_n_returns_best_job_unchanged() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0, 0.0]));
        // Job 3 has the best validation proxy.
        let m = manifest(vec![
            job(&dir, 1, vec![0.1, 0.1], -0.9),
            job(&dir, 2, vec![0.2, 0.2], -0.7),
            job(&dir, 3, vec![0.3, 0.3], -0.1),
            job(&dir, 4, vec![0.4, 0.4], -0.5),
        ]);
        let output = dir.path().join("model.1");
        ModelAggregator::new(engine)
            .aggregate(&m, &AggregationMode::BestOfN, &output)
            .unwrap();

        let round = VectorModel::load(&output).unwrap();
        assert_eq!(round.params, vec![0.3, 0.3]);
        // The other jobs' artifacts are gone.
        for j in &m.jobs {
            assert!(!j.output.exists());
        }
    }

    #[test]
    fn uniform_average_of_identical_models_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0, 0.0]));
        let params = vec![0.5, -0.25];
        let m = manifest(vec![
            job(&dir, 1, params.clone(), -1.0),
            job(&dir, 2, params.clone(), -1.0),
            job(&dir, 3, params.clone(), -1.0),
        ]);
        let output = dir.path().join("model.1");
        ModelAggregator::new(engine)
            .aggregate(&m, &AggregationMode::UniformAverage, &output)
            .unwrap();

        let round = VectorModel::load(&output).unwrap();
        for (a, b) in round.params.iter().zip(&params) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn failed_jobs_are_excluded_from_the_average() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0]));
        let mut failed = job(&dir, 2, vec![100.0], -1.0);
        failed.succeeded = false;
        let m = manifest(vec![
            job(&dir, 1, vec![1.0], -1.0),
            failed,
            job(&dir, 3, vec![3.0], -1.0),
        ]);
        let output = dir.path().join("model.1");
        ModelAggregator::new(engine)
            .aggregate(&m, &AggregationMode::UniformAverage, &output)
            .unwrap();

        let round = VectorModel::load(&output).unwrap();
        assert!((round.params[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn subset_weighted_average_uses_label_weights() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0]));
        let mut a = job(&dir, 1, vec![0.0], -1.0);
        a.subset = Some("news".into());
        let mut b = job(&dir, 2, vec![4.0], -1.0);
        b.subset = Some("calls".into());
        let m = manifest(vec![a, b]);
        let weights = HashMap::from([("news".to_string(), 3.0), ("calls".to_string(), 1.0)]);
        let output = dir.path().join("model.1");
        ModelAggregator::new(engine)
            .aggregate(&m, &AggregationMode::SubsetWeighted(weights), &output)
            .unwrap();

        let round = VectorModel::load(&output).unwrap();
        assert!((round.params[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_subset_label_is_an_error_not_a_silent_drop() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0]));
        let mut a = job(&dir, 1, vec![1.0], -1.0);
        a.subset = Some("unmapped".into());
        let m = manifest(vec![a]);
        let weights = HashMap::from([("news".to_string(), 1.0)]);
        let err = ModelAggregator::new(engine)
            .aggregate(
                &m,
                &AggregationMode::SubsetWeighted(weights),
                &dir.path().join("model.1"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unmapped"));
    }

    #[test]
    fn empty_round_model_is_fatal() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(vec![0.0]));
        // A "successful" job whose artifact is an empty file: best-of-N
        // copies it verbatim, so the produced round model is empty too.
        let output_raw = dir.path().join("model.1.1");
        std::fs::write(&output_raw, b"").unwrap();
        let m = manifest(vec![JobOutcome {
            job_id: 1,
            archive_index: 1,
            phase_shift: 0,
            subset: None,
            output: output_raw,
            succeeded: true,
            objective: Some(-1.0),
            error: None,
        }]);
        let err = ModelAggregator::new(engine)
            .aggregate(&m, &AggregationMode::BestOfN, &dir.path().join("model.1"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::MissingArtifact { .. })
        ));
    }
}
