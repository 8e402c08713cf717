//! Shard processing: per-shard lifecycle, retry, progress and the worker loop.

mod metrics;
mod progress;
mod retry;
mod scheduler;
mod shard_pipeline;


pub use metrics::{format_summary, print_summary, Metrics, MetricsSnapshot};
pub use progress::{ProgressCounters, ProgressReporter};
pub use retry::RetryPolicy;
pub use scheduler::{Worker, WorkerStats};
pub use shard_pipeline::{ShardOutcome, ShardPipeline, ShardState, SkipReason, StageTimings};
