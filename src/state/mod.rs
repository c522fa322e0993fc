//! Persisted run state
//!
//! A typed store for the scalar records the orchestrator keeps between
//! rounds and across resumed runs: the per-run random seed, the
//! processed-archive counter, and the write-once phase-subsampling factor.
//! Each record is a small JSON scalar in the run directory; nothing else in
//! the crate touches these files directly.

pub mod cache;

pub use cache::CacheHandoff;

use crate::Result;
use anyhow::Context;
use log::warn;
use std::fs;
use std::path::PathBuf;

/// Role of a persisted scalar record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    /// Per-run random seed
    Seed,
    /// Total archives processed so far (drives the scheduler rotation)
    ArchivesProcessed,
    /// Phase-subsampling factor, written once at initialization
    SubsamplingFactor,
}

impl StateKey {
    fn file_name(self) -> &'static str {
        match self {
            StateKey::Seed => "seed",
            StateKey::ArchivesProcessed => "archives_processed",
            StateKey::SubsamplingFactor => "subsampling_factor",
        }
    }
}

/// Typed get/set store for run-directory state records
#[derive(Debug, Clone)]
pub struct StateStore {
    run_dir: PathBuf,
}

impl StateStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    fn path(&self, key: StateKey) -> PathBuf {
        self.run_dir.join(key.file_name())
    }

    /// Read a record, or None if it has never been written
    pub fn get(&self, key: StateKey) -> Result<Option<i64>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state record {}", path.display()))?;
        let value: i64 = serde_json::from_str(contents.trim())
            .with_context(|| format!("corrupt state record {}", path.display()))?;
        Ok(Some(value))
    }

    pub fn set(&self, key: StateKey, value: i64) -> Result<()> {
        let path = self.path(key);
        fs::write(&path, serde_json::to_string(&value)?)
            .with_context(|| format!("failed to write state record {}", path.display()))
    }
}

/// Guards the run's seed, processed-archive counter, and subsampling factor
///
/// The seed is persisted on the first invocation for a run directory; later
/// invocations compare against it. A mismatch is not fatal: it is logged as
/// a warning and the new seed is adopted, tolerating legitimate
/// reconfiguration of a resumed run while still surfacing the change.
#[derive(Debug)]
pub struct ProgressGuard {
    store: StateStore,
}

impl ProgressGuard {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StateStore::new(run_dir),
        }
    }

    /// Persist `seed` on first use, or compare against the saved one.
    /// Returns the seed to use (always `seed`).
    pub fn check_or_init_seed(&self, seed: i64) -> Result<i64> {
        match self.store.get(StateKey::Seed)? {
            Some(saved) if saved != seed => {
                warn!(
                    "the random seed provided to this run (seed={}) differs from the one \
                     saved last time (seed={}); using seed={}",
                    seed, saved, seed
                );
                self.store.set(StateKey::Seed, seed)?;
            }
            Some(_) => {}
            None => self.store.set(StateKey::Seed, seed)?,
        }
        Ok(seed)
    }

    /// Archives processed by earlier rounds (zero for a fresh run)
    pub fn archives_processed(&self) -> Result<u64> {
        Ok(self
            .store
            .get(StateKey::ArchivesProcessed)?
            .unwrap_or(0)
            .max(0) as u64)
    }

    /// Advance the processed-archive counter by one round's job count and
    /// return the new total
    pub fn advance(&self, job_count: u32) -> Result<u64> {
        let next = self.archives_processed()? + u64::from(job_count);
        self.store.set(StateKey::ArchivesProcessed, next as i64)?;
        Ok(next)
    }

    /// Record the subsampling factor once at initialization. The factor
    /// changes the meaning of the archive rotation, so resuming with a
    /// different value is a configuration error rather than a warning.
    pub fn init_subsampling_factor(&self, factor: u32) -> Result<()> {
        match self.store.get(StateKey::SubsamplingFactor)? {
            None => self.store.set(StateKey::SubsamplingFactor, i64::from(factor)),
            Some(saved) if saved == i64::from(factor) => Ok(()),
            Some(saved) => Err(crate::error::OrchestratorError::Configuration(format!(
                "run was initialized with subsampling_factor={} but {} was supplied",
                saved, factor
            ))
            .into()),
        }
    }
}
