//! Configuration validation
//!
//! Runs before the iteration loop; a failure here is a ConfigurationError
//! and no partial state has been created yet.

use super::RunConfig;
use crate::error::OrchestratorError;
use crate::Result;

fn invalid(msg: String) -> anyhow::Error {
    OrchestratorError::Configuration(msg).into()
}

/// Validate a complete run configuration
pub fn validate_config(config: &RunConfig) -> Result<()> {
    if !config.run_dir.is_dir() {
        return Err(invalid(format!(
            "run directory {} does not exist",
            config.run_dir.display()
        )));
    }
    if config.num_iterations == 0 {
        return Err(invalid("num_iterations must be at least 1".into()));
    }
    if config.num_archives == 0 {
        return Err(invalid("num_archives must be at least 1".into()));
    }
    if config.subsampling_factor == 0 {
        return Err(invalid("subsampling_factor must be at least 1".into()));
    }

    validate_jobs(config)?;
    validate_schedule(config)?;
    validate_training(config)?;
    validate_subsets(config)?;
    validate_combination(config)?;

    Ok(())
}

fn validate_jobs(config: &RunConfig) -> Result<()> {
    let jobs = &config.jobs;
    if jobs.num_jobs_initial == 0 || jobs.num_jobs_final == 0 {
        return Err(invalid("job counts must be at least 1".into()));
    }
    if jobs.num_jobs_initial > jobs.num_jobs_final {
        return Err(invalid(format!(
            "num_jobs_initial ({}) must not exceed num_jobs_final ({})",
            jobs.num_jobs_initial, jobs.num_jobs_final
        )));
    }
    Ok(())
}

fn validate_schedule(config: &RunConfig) -> Result<()> {
    let s = &config.schedule;
    if s.initial_effective_lrate <= 0.0 || s.final_effective_lrate <= 0.0 {
        return Err(invalid("learning rates must be positive".into()));
    }
    if !(0.0..=1.0).contains(&s.shrinkage) || s.shrinkage == 0.0 {
        return Err(invalid(format!(
            "shrinkage must be in (0, 1], got {}",
            s.shrinkage
        )));
    }
    Ok(())
}

fn validate_training(config: &RunConfig) -> Result<()> {
    let t = &config.training;
    if t.minibatch_size == 0 {
        return Err(invalid("minibatch_size must be at least 1".into()));
    }
    if t.max_param_change <= 0.0 {
        return Err(invalid(format!(
            "max_param_change must be positive, got {}",
            t.max_param_change
        )));
    }
    if t.aux_scale_target < 0.0 {
        return Err(invalid(format!(
            "aux_scale_target must be non-negative, got {}",
            t.aux_scale_target
        )));
    }
    if t.aux_scale_target > 0.0 && t.aux_warmup_iterations == 0 {
        return Err(invalid(
            "aux_warmup_iterations must be at least 1 when aux_scale_target is set".into(),
        ));
    }
    Ok(())
}

fn validate_subsets(config: &RunConfig) -> Result<()> {
    let Some(subsets) = &config.subsets else {
        return Ok(());
    };
    if subsets.archive_subsets.len() != config.num_archives as usize {
        return Err(invalid(format!(
            "archive_subsets has {} entries but num_archives is {}",
            subsets.archive_subsets.len(),
            config.num_archives
        )));
    }
    for label in &subsets.archive_subsets {
        if !subsets.weights.contains_key(label) {
            return Err(invalid(format!(
                "no aggregation weight configured for subset '{}'",
                label
            )));
        }
    }
    if subsets.weights.values().any(|&w| w < 0.0 || !w.is_finite()) {
        return Err(invalid("subset weights must be finite and non-negative".into()));
    }
    if subsets.weights.values().sum::<f64>() <= 0.0 {
        return Err(invalid("subset weights must not all be zero".into()));
    }
    Ok(())
}

fn validate_combination(config: &RunConfig) -> Result<()> {
    let c = &config.combination;
    if c.max_models_combine == 0 {
        return Err(invalid("max_models_combine must be at least 1".into()));
    }
    if !c.sum_to_one_penalty.is_finite() {
        return Err(invalid(format!(
            "sum_to_one_penalty must be finite, got {}",
            c.sum_to_one_penalty
        )));
    }
    Ok(())
}
