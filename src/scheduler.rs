//! Archive scheduling
//!
//! Maps the monotonically increasing processed-archive counter to a per-job
//! (archive index, phase shift) pair. The mapping is a pure function of its
//! inputs: over any `num_archives` consecutive values of the global counter
//! every archive is visited exactly once, and the phase shift rotates once
//! per full pass over the archive set so that the same archive is seen at a
//! different alignment phase on successive passes.

/// One job's data assignment for a round
///
/// `archive_index` is 1-based, matching the on-disk archive numbering.
/// `phase_shift` is in `[0, subsampling_factor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub archive_index: u32,
    pub phase_shift: u32,
}

/// Compute the archive index and phase shift for one job
///
/// # Arguments
///
/// * `processed_count` - Total archives processed before this round
/// * `job_id` - 1-based job id within the round
/// * `num_archives` - Fixed archive count for the run (> 0)
/// * `subsampling_factor` - Phase-subsampling factor (>= 1)
///
/// The result depends only on the arguments; calling twice with the same
/// inputs yields the same assignment.
pub fn assign(
    processed_count: u64,
    job_id: u32,
    num_archives: u32,
    subsampling_factor: u32,
) -> Assignment {
    debug_assert!(job_id >= 1, "job ids are 1-based");
    debug_assert!(num_archives > 0);
    debug_assert!(subsampling_factor >= 1);

    // k is the zero-based global counter we derive the other indexes from.
    let k = processed_count + u64::from(job_id) - 1;
    let num_archives = u64::from(num_archives);
    let archive_index = (k % num_archives) + 1;
    let phase_shift = (archive_index + k / num_archives) % u64::from(subsampling_factor);

    Assignment {
        archive_index: archive_index as u32,
        phase_shift: phase_shift as u32,
    }
}
