//! Cross-iteration cache handoff
//!
//! The optimizer cache is the only artifact shared between consecutive
//! rounds: exactly one job of iteration `i` writes `cache.(i+1)`, and every
//! job of iteration `i+1` reads it. `CacheHandoff` makes the single-writer
//! discipline explicit: the write slot for a round boundary can be claimed
//! at most once, and the slot is deleted (`retire`) as soon as the round
//! that consumed it completes.

use crate::Result;
use anyhow::Context;
use log::{debug, warn};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Manages the cache-artifact series of one run directory
#[derive(Debug)]
pub struct CacheHandoff {
    run_dir: PathBuf,
    claimed: Mutex<HashSet<u32>>,
}

impl CacheHandoff {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn slot_path(&self, iteration: u32) -> PathBuf {
        self.run_dir.join(format!("cache.{}", iteration))
    }

    /// Claim the write slot for the cache consumed by `next_iteration`.
    ///
    /// Returns the path the producing job must write. Claiming the same slot
    /// twice is a bug in the dispatcher and fails.
    pub fn claim_writer(&self, next_iteration: u32) -> Result<PathBuf> {
        let mut claimed = self.claimed.lock().unwrap();
        if !claimed.insert(next_iteration) {
            anyhow::bail!(
                "cache slot for iteration {} already has a designated writer",
                next_iteration
            );
        }
        Ok(self.slot_path(next_iteration))
    }

    /// Path of the cache readable by jobs of `iteration`, if one exists.
    ///
    /// Iteration 0 is a cold start and never has a cache. A missing cache on
    /// a later iteration is tolerated (the engine falls back to a cold
    /// start) but logged.
    pub fn read_slot(&self, iteration: u32) -> Option<PathBuf> {
        if iteration == 0 {
            return None;
        }
        let path = self.slot_path(iteration);
        if path.exists() {
            Some(path)
        } else {
            warn!(
                "no cache artifact for iteration {}; jobs start cold",
                iteration
            );
            None
        }
    }

    /// Delete the cache consumed by `iteration` once that round completes
    pub fn retire(&self, iteration: u32) -> Result<()> {
        let path = self.slot_path(iteration);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete consumed cache {}", path.display()))?;
            debug!("retired cache artifact {}", path.display());
        }
        Ok(())
    }
}
