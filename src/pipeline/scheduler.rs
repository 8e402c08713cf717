//! Worker loop over the owned subset of the shard list.
//!
//! Shards are processed one at a time in input order. A failed shard is
//! counted and the loop moves on; only a shutdown request ends the loop
//! before the subset is exhausted.

use crate::config::ProcessingConfig;
use crate::index::{ShardEntry, ShardList, WorkAssignment};
use crate::pipeline::{print_summary, Metrics, ProgressReporter, ShardOutcome, ShardPipeline};
use std::sync::Arc;
use tokio::sync::watch;

/// Drives a [`ShardPipeline`] over the positions owned by one worker.
pub struct Worker {
    pipeline: ShardPipeline,
    assignment: WorkAssignment,
    metrics: Arc<Metrics>,
    processing: ProcessingConfig,
}

impl Worker {
    pub fn new(
        pipeline: ShardPipeline,
        assignment: WorkAssignment,
        metrics: Arc<Metrics>,
        processing: ProcessingConfig,
    ) -> Self {
        Self {
            pipeline,
            assignment,
            metrics,
            processing,
        }
    }

    pub fn assignment(&self) -> WorkAssignment {
        self.assignment
    }

    /// Process every owned entry of `list` unless `shutdown` is raised first.
    pub async fn run(&self, list: &ShardList, shutdown: watch::Receiver<bool>) -> WorkerStats {
        let total_lines = list.len();
        let mut progress = ProgressReporter::new(
            self.assignment,
            total_lines,
            self.processing.progress_bar_width,
            self.processing.enable_progress,
        );

        let mut stats = WorkerStats {
            total_lines,
            assigned: progress.counters().expected_for_this_worker,
            ..Default::default()
        };

        tracing::info!(
            "Worker {} owns {} of {} lines",
            self.assignment,
            stats.assigned,
            total_lines
        );

        for (position, entry) in self.assignment.select(list.entries()) {
            if *shutdown.borrow() {
                tracing::warn!(
                    "Shutdown requested, stopping before line {} ({} of {} processed)",
                    position + 1,
                    stats.processed,
                    stats.assigned
                );
                stats.interrupted = true;
                break;
            }

            match entry {
                ShardEntry::Blank => {
                    progress.on_line_start("(blank)");
                    tracing::debug!("Line {} is blank", position + 1);
                    self.metrics.add_blank_line();
                    stats.blank += 1;
                }
                ShardEntry::Invalid(error) => {
                    progress.on_line_start("(invalid)");
                    tracing::error!("{}", error);
                    self.metrics.add_shard_failed();
                    stats.failed += 1;
                }
                ShardEntry::Shard(shard) => {
                    progress.on_shard_start(shard);
                    let outcome = self.pipeline.process(shard).await;
                    stats.record(&outcome);
                }
            }

            stats.processed += 1;
            progress.on_shard_done();
            progress.emit();
        }

        tracing::info!("{}", stats);

        if self.processing.enable_summary {
            print_summary(&self.metrics.snapshot());
        }
        if let Some(ref path) = self.processing.metrics_output_path {
            if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }

        stats
    }
}

/// Statistics from a worker run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Lines in the shard list
    pub total_lines: usize,

    /// Lines owned by this worker
    pub assigned: usize,

    /// Owned lines handled so far, blank lines included
    pub processed: usize,

    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub blank: usize,

    /// Shards whose working directories could not be removed
    pub cleanup_failures: usize,

    /// The run stopped early on a shutdown request
    pub interrupted: bool,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ShardOutcome) {
        match outcome {
            ShardOutcome::Done { .. } => self.done += 1,
            ShardOutcome::Skipped { .. } => self.skipped += 1,
            ShardOutcome::Failed { .. } => self.failed += 1,
        }
        if !outcome.cleanup_ok() {
            self.cleanup_failures += 1;
        }
    }

    /// Whether every owned line was handled.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.processed == self.assigned
    }
}

impl std::fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed {} of {} shards (done: {}, skipped: {}, failed: {}, blank: {})",
            self.processed, self.assigned, self.done, self.skipped, self.failed, self.blank
        )?;
        if self.cleanup_failures > 0 {
            write!(f, ", {} cleanup failures", self.cleanup_failures)?;
        }
        if self.interrupted {
            write!(f, ", interrupted")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ShardError, Stage};
    use crate::pipeline::StageTimings;

    #[test]
    fn test_worker_stats_display() {
        let stats = WorkerStats {
            total_lines: 10,
            assigned: 5,
            processed: 5,
            done: 3,
            skipped: 0,
            failed: 1,
            blank: 1,
            cleanup_failures: 0,
            interrupted: false,
        };

        assert_eq!(
            stats.to_string(),
            "Processed 5 of 5 shards (done: 3, skipped: 0, failed: 1, blank: 1)"
        );
        assert!(stats.is_complete());
    }

    #[test]
    fn test_worker_stats_record() {
        let mut stats = WorkerStats::default();
        stats.record(&ShardOutcome::Done {
            timings: StageTimings::default(),
            cleanup_ok: true,
            states: Vec::new(),
        });
        stats.record(&ShardOutcome::Failed {
            stage: Stage::Transform,
            error: ShardError::TransformOutputMissing {
                dir: "/tmp/out".into(),
            },
            cleanup_ok: false,
            states: Vec::new(),
        });

        assert_eq!(stats.done, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cleanup_failures, 1);
        assert!(stats.to_string().contains("1 cleanup failures"));
    }

    #[test]
    fn test_interrupted_is_incomplete() {
        let stats = WorkerStats {
            assigned: 4,
            processed: 2,
            interrupted: true,
            ..Default::default()
        };
        assert!(!stats.is_complete());
        assert!(stats.to_string().ends_with("interrupted"));
    }
}
