//! Single-line progress reporting for a worker.
//!
//! The reporter only observes: the worker loop calls it, it never calls
//! back, and a failure to write the line is ignored.

use crate::index::{ShardDescriptor, WorkAssignment};
use std::io::Write;

/// Counters tracked by [`ProgressReporter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounters {
    pub total_shards: usize,
    pub expected_for_this_worker: usize,
    pub processed_so_far: usize,
}

impl ProgressCounters {
    /// Rounded completion percentage; 0 when nothing is expected.
    pub fn percentage(&self) -> usize {
        if self.expected_for_this_worker == 0 {
            return 0;
        }
        let expected = self.expected_for_this_worker;
        (self.processed_so_far * 100 + expected / 2) / expected
    }
}

/// Tracks shards processed against the worker's expected count.
#[derive(Debug)]
pub struct ProgressReporter {
    counters: ProgressCounters,
    assignment: WorkAssignment,
    current: Option<String>,
    bar_width: usize,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(
        assignment: WorkAssignment,
        total_shards: usize,
        bar_width: usize,
        enabled: bool,
    ) -> Self {
        Self {
            counters: ProgressCounters {
                total_shards,
                expected_for_this_worker: assignment.expected_count(total_shards),
                processed_so_far: 0,
            },
            assignment,
            current: None,
            bar_width: bar_width.max(1),
            enabled,
        }
    }

    pub fn counters(&self) -> ProgressCounters {
        self.counters
    }

    pub fn on_shard_start(&mut self, shard: &ShardDescriptor) {
        self.on_line_start(shard.label());
    }

    /// Set the label shown for the line being handled.
    pub fn on_line_start(&mut self, label: impl Into<String>) {
        self.current = Some(label.into());
    }

    pub fn on_shard_done(&mut self) {
        self.counters.processed_so_far += 1;
    }

    /// Render the status line.
    pub fn render(&self) -> String {
        let percentage = self.counters.percentage();
        let filled = (percentage.min(100) * self.bar_width) / 100;
        format!(
            "[{}{}] {:>3}% ({}/{}) worker {} | {}",
            "#".repeat(filled),
            "-".repeat(self.bar_width - filled),
            percentage,
            self.counters.processed_so_far,
            self.counters.expected_for_this_worker,
            self.assignment,
            self.current.as_deref().unwrap_or("-"),
        )
    }

    /// Write the status line to stderr.
    pub fn emit(&self) {
        if !self.enabled {
            return;
        }
        let line = self.render();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}
