//! Run metrics: shard outcomes, retries and per-stage timings.

use crate::error::Stage;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a worker run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Shards that went through every stage
    pub shards_done: AtomicU64,

    /// Shards skipped because their output was already published
    pub shards_skipped: AtomicU64,

    /// Shards that failed in some stage
    pub shards_failed: AtomicU64,

    /// Blank lines in this worker's subset
    pub blank_lines: AtomicU64,

    /// Stage retries after transient failures
    pub retries: AtomicU64,

    /// Directories that could not be removed
    pub cleanup_failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent fetching blobs (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent in the transformer (microseconds)
    pub transform_us: AtomicU64,

    /// Time spent publishing (microseconds)
    pub publish_us: AtomicU64,

    /// Time spent removing local directories (microseconds)
    pub cleanup_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_shard_done(&self) {
        self.shards_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_shard_skipped(&self) {
        self.shards_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_shard_failed(&self) {
        self.shards_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_blank_line(&self) {
        self.blank_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cleanup_failure(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a stage.
    pub fn add_stage_time(&self, stage: Stage, duration: Duration) {
        let counter = match stage {
            Stage::Fetch => &self.fetch_us,
            Stage::Transform => &self.transform_us,
            Stage::Publish => &self.publish_us,
            Stage::Cleanup => &self.cleanup_us,
        };
        counter.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get shards per hour.
    pub fn shards_per_hour(&self) -> f64 {
        let shards = self.shards_done.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            shards as f64 * 3600.0 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |counter: &AtomicU64| counter.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            shards_done: self.shards_done.load(Ordering::Relaxed),
            shards_skipped: self.shards_skipped.load(Ordering::Relaxed),
            shards_failed: self.shards_failed.load(Ordering::Relaxed),
            blank_lines: self.blank_lines.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            shards_per_hour: self.shards_per_hour(),
            fetch_secs: secs(&self.fetch_us),
            transform_secs: secs(&self.transform_us),
            publish_secs: secs(&self.publish_us),
            cleanup_secs: secs(&self.cleanup_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub shards_done: u64,
    pub shards_skipped: u64,
    pub shards_failed: u64,
    pub blank_lines: u64,
    pub retries: u64,
    pub cleanup_failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub shards_per_hour: f64,
    /// Total time spent fetching blobs (seconds)
    pub fetch_secs: f64,
    /// Total time spent in the transformer (seconds)
    pub transform_secs: f64,
    /// Total time spent publishing (seconds)
    pub publish_secs: f64,
    /// Total time spent on cleanup (seconds)
    pub cleanup_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    fn stage_total(&self) -> f64 {
        self.fetch_secs + self.transform_secs + self.publish_secs + self.cleanup_secs
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.stage_total();
        let pct = |secs: f64| if total > 0.0 { secs / total * 100.0 } else { 0.0 };

        write!(
            f,
            "Shards: {} done, {} skipped, {} failed | Retries: {} | \
             Cleanup failures: {} | Rate: {:.1} shards/h | Elapsed: {:.1}s | \
             Time: fetch {:.0}% | transform {:.0}% | publish {:.0}% | cleanup {:.0}%",
            self.shards_done,
            self.shards_skipped,
            self.shards_failed,
            self.retries,
            self.cleanup_failures,
            self.shards_per_hour,
            self.elapsed.as_secs_f64(),
            pct(self.fetch_secs),
            pct(self.transform_secs),
            pct(self.publish_secs),
            pct(self.cleanup_secs),
        )
    }
}

/// Print a final summary of a run.
pub fn print_summary(snapshot: &MetricsSnapshot) {
    print!("{}", format_summary(snapshot));
}

/// Multi-line end-of-run summary.
pub fn format_summary(snapshot: &MetricsSnapshot) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "\n=== Worker Summary ===");
    let _ = writeln!(out, "Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
    let _ = writeln!(out, "Shards done: {}", snapshot.shards_done);
    let _ = writeln!(out, "Shards skipped: {}", snapshot.shards_skipped);
    let _ = writeln!(out, "Shards failed: {}", snapshot.shards_failed);
    let _ = writeln!(out, "Blank lines: {}", snapshot.blank_lines);
    let _ = writeln!(out, "Retries: {}", snapshot.retries);
    let _ = writeln!(out, "Processing rate: {:.1} shards/h", snapshot.shards_per_hour);

    let total = snapshot.stage_total();
    if total > 0.0 {
        let _ = writeln!(out, "\n--- Stage Time Breakdown ---");
        for (name, secs) in [
            ("Fetch:", snapshot.fetch_secs),
            ("Transform:", snapshot.transform_secs),
            ("Publish:", snapshot.publish_secs),
            ("Cleanup:", snapshot.cleanup_secs),
        ] {
            let _ = writeln!(out, "{:<11} {:>8.1}s ({:>5.1}%)", name, secs, secs / total * 100.0);
        }
    }

    if snapshot.cleanup_failures > 0 {
        let _ = writeln!(
            out,
            "\nWARNING: {} local directories could not be removed; check free disk space",
            snapshot.cleanup_failures
        );
    }
    let _ = writeln!(out, "======================\n");
    out
}
