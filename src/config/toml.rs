//! TOML configuration file parsing

use super::RunConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse a run configuration from a TOML file
pub fn parse_toml_file(path: &Path) -> Result<RunConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse a run configuration from a TOML string
pub fn parse_toml_string(contents: &str) -> Result<RunConfig> {
    let config: RunConfig =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_toml_string(
            r#"
            run_dir = "/tmp/run"
            num_iterations = 40
            num_archives = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.num_iterations, 40);
        assert_eq!(config.num_archives, 12);
        assert_eq!(config.subsampling_factor, 3);
        assert_eq!(config.training.aux_warmup_iterations, 15);
        assert_eq!(config.combination.max_models_combine, 20);
        assert_eq!(config.combination.sum_to_one_penalty, 0.0);
        assert!(config.subsets.is_none());
    }

    #[test]
    fn parses_full_config() {
        let config = parse_toml_string(
            r#"
            run_dir = "/data/exp/run1"
            num_iterations = 100
            num_archives = 24
            subsampling_factor = 3
            seed = 42

            [jobs]
            num_jobs_initial = 2
            num_jobs_final = 8

            [schedule]
            initial_effective_lrate = 0.002
            final_effective_lrate = 0.0002
            shrinkage = 0.99

            [training]
            minibatch_size = 64
            max_param_change = 1.5
            momentum = 0.9
            l2_regularize = 0.0001
            aux_scale_target = 0.3
            aux_warmup_iterations = 15

            [subsets]
            archive_subsets = ["news", "news", "calls"]
            [subsets.weights]
            news = 0.7
            calls = 0.3

            [combination]
            max_models_combine = 10
            sum_to_one_penalty = 0.0001
            "#,
        )
        .unwrap();

        assert_eq!(config.jobs.num_jobs_final, 8);
        assert!((config.schedule.shrinkage - 0.99).abs() < 1e-12);
        assert_eq!(config.training.minibatch_size, 64);
        let subsets = config.subsets.unwrap();
        assert_eq!(subsets.archive_subsets.len(), 3);
        assert!((subsets.weights["calls"] - 0.3).abs() < 1e-12);
        assert!((config.combination.sum_to_one_penalty - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse_toml_string("run_dir = [nonsense").is_err());
    }
}
