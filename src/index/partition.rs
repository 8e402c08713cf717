//! Deterministic, coordination-free work partitioning.
//!
//! A shard at zero-based position `p` belongs to worker `i` of `j` iff
//! `p % j == i`. Every worker that reads the same shard list computes the
//! same split, so no coordination service is needed and a restarted worker
//! picks up exactly the subset it had before.

use crate::error::{Result, ShardError};

/// The `(worker_index, worker_count)` pair for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkAssignment {
    worker_index: usize,
    worker_count: usize,
}

impl WorkAssignment {
    /// Create an assignment, rejecting out-of-range values.
    pub fn new(worker_index: usize, worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(ShardError::argument("workerCount must be positive"));
        }
        if worker_index >= worker_count {
            return Err(ShardError::argument(format!(
                "workerIndex must be less than workerCount (got {} >= {})",
                worker_index, worker_count
            )));
        }
        Ok(Self {
            worker_index,
            worker_count,
        })
    }

    /// Create an assignment from signed command-line values.
    pub fn from_args(worker_index: i64, worker_count: i64) -> Result<Self> {
        if worker_count <= 0 {
            return Err(ShardError::argument(format!(
                "workerCount must be positive (got {})",
                worker_count
            )));
        }
        if worker_index < 0 {
            return Err(ShardError::argument(format!(
                "workerIndex must be non-negative (got {})",
                worker_index
            )));
        }
        let count = usize::try_from(worker_count)
            .map_err(|_| ShardError::argument("workerCount is too large"))?;
        let index = usize::try_from(worker_index)
            .map_err(|_| ShardError::argument("workerIndex is too large"))?;
        Self::new(index, count)
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Whether the line at `position` belongs to this worker.
    pub fn owns(&self, position: usize) -> bool {
        position % self.worker_count == self.worker_index
    }

    /// Number of positions in `[0, total_lines)` owned by this worker.
    pub fn expected_count(&self, total_lines: usize) -> usize {
        if self.worker_index >= total_lines {
            return 0;
        }
        (total_lines - self.worker_index).div_ceil(self.worker_count)
    }

    /// Owned positions in ascending order.
    pub fn owned_positions(&self, total_lines: usize) -> impl Iterator<Item = usize> {
        (self.worker_index..total_lines).step_by(self.worker_count)
    }

    /// Owned items of `items` with their positions.
    pub fn select<'a, T>(&self, items: &'a [T]) -> impl Iterator<Item = (usize, &'a T)> + 'a {
        self.owned_positions(items.len()).map(move |p| (p, &items[p]))
    }
}

impl std::fmt::Display for WorkAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.worker_index, self.worker_count)
    }
}
