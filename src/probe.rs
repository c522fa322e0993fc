//! Background validation probes
//!
//! Once per iteration, right after the round model is finalized, two
//! read-only evaluations are fired in the background: one against the
//! held-out subset and one against a training sample. They exist purely for
//! monitoring: the iteration loop never waits for them, and a probe failure
//! never affects training state or the exit code. The handles are kept in a
//! process-wide set and drained exactly once, at shutdown, so any failures
//! are observable before the process exits.

use crate::engine::{ComputeEngine, DataSubset};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Collection of detached probe task handles
#[derive(Default)]
pub struct ProbeSet {
    handles: Vec<JoinHandle<()>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire one non-blocking probe of `model` against `subset`.
    ///
    /// The result is logged from the background task; errors are warnings.
    pub fn fire(
        &mut self,
        engine: Arc<dyn ComputeEngine>,
        model: PathBuf,
        subset: DataSubset,
        iteration: u32,
    ) {
        let handle = tokio::task::spawn_blocking(move || {
            match engine.evaluate_objective(&model, subset) {
                Ok(objective) => info!(
                    "iteration {}: {:?} objective {:.6}",
                    iteration, subset, objective
                ),
                Err(err) => warn!(
                    "iteration {}: {:?} probe failed: {:#}",
                    iteration, subset, err
                ),
            }
        });
        self.handles.push(handle);
    }

    /// Number of probes fired so far (including completed ones)
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Await every outstanding probe. Called exactly once, at shutdown;
    /// probe task faults are logged, never propagated.
    pub async fn drain(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(fault) = handle.await {
                warn!("probe task fault: {}", fault);
            }
        }
    }
}
