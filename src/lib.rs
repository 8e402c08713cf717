//! Shard Convert
//!
//! Batch worker that converts dataset shards into compressed line-delimited
//! records. A shard list is split across independent workers by line
//! position, and each worker runs its subset one shard at a time through
//! external tools.
//!
//! # Architecture
//!
//! - **Index**: Shard list loading and coordination-free work partitioning
//! - **I/O**: Local layout, external tool execution and remote store access
//! - **Pipeline**: Per-shard fetch → transform → publish → cleanup lifecycle,
//!   retry, progress and the worker loop
//!
//! # Usage
//!
//! ```no_run
//! use shard_convert::{run_worker, Config, RunArgs, RunConfig, TokioProcessRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = RunArgs {
//!         input: "shards.txt".to_string(),
//!         worker_index: 0,
//!         worker_count: 4,
//!     };
//!     let run = RunConfig::new(&args, Config::default())?;
//!     let (_tx, shutdown) = tokio::sync::watch::channel(false);
//!     let stats = run_worker(run, Arc::new(TokioProcessRunner), shutdown).await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod pipeline;

pub use config::Config;
pub use error::{ShardError, Stage};
pub use index::{ShardDescriptor, ShardEntry, ShardList, WorkAssignment};
pub use io::{CompletionChecker, ProcessRunner, TokioProcessRunner};
pub use pipeline::{Metrics, ShardOutcome, ShardPipeline, Worker, WorkerStats};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

/// Worker arguments as given on the command line.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Shard list: local path or `s3://` URI
    pub input: String,
    pub worker_index: i64,
    pub worker_count: i64,
}

/// Validated, immutable settings for one worker run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: String,
    pub assignment: WorkAssignment,
    pub config: Arc<Config>,
}

impl RunConfig {
    /// Validate arguments and configuration. Touches neither disk nor network.
    pub fn new(args: &RunArgs, config: Config) -> Result<Self> {
        let assignment = WorkAssignment::from_args(args.worker_index, args.worker_count)?;
        config.validate()?;

        Ok(Self {
            input: args.input.clone(),
            assignment,
            config: Arc::new(config),
        })
    }
}

/// Build the completion checker for the configured remote, if there is one.
pub fn completion_checker(config: &Config) -> Result<Option<CompletionChecker>> {
    let store = io::create_remote_store(&config.remote)?;
    Ok(store.map(|store| {
        CompletionChecker::new(
            store,
            config.remote.output_root_key(),
            config.remote.output_suffix.clone(),
        )
    }))
}

/// Run one worker over its subset of the shard list.
pub async fn run_worker(
    run: RunConfig,
    runner: Arc<dyn ProcessRunner>,
    shutdown: watch::Receiver<bool>,
) -> Result<WorkerStats> {
    let config = run.config;

    tracing::info!("Starting worker {}", run.assignment);
    tracing::info!("Loading shard list from {}", run.input);
    let list = ShardList::load(&run.input).await?;

    let metrics = Metrics::new();
    let mut pipeline = ShardPipeline::new(config.clone(), runner, metrics.clone())
        .with_shutdown(shutdown.clone());

    if config.processing.skip_completed {
        match completion_checker(&config)? {
            Some(checker) => pipeline = pipeline.with_completion_checker(checker),
            None => tracing::warn!("skip_completed is set but no remote is configured"),
        }
    }

    let worker = Worker::new(pipeline, run.assignment, metrics, config.processing.clone());
    let stats = worker.run(&list, shutdown).await;

    tracing::info!("Worker {} finished: {}", run.assignment, stats);

    Ok(stats)
}

/// One owned line of a worker's plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub position: usize,
    pub description: String,
}

impl std::fmt::Display for PlanItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>6}  {}", self.position, self.description)
    }
}

/// List what a worker would process without running anything.
pub fn plan(list: &ShardList, assignment: WorkAssignment) -> Vec<PlanItem> {
    assignment
        .select(list.entries())
        .map(|(position, entry)| PlanItem {
            position,
            description: match entry {
                ShardEntry::Shard(shard) => shard.label(),
                ShardEntry::Blank => "(blank)".to_string(),
                ShardEntry::Invalid(e) => format!("(invalid: {})", e),
            },
        })
        .collect()
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_rejects_bad_assignment() {
        let args = RunArgs {
            input: "/nonexistent/shards.txt".to_string(),
            worker_index: 3,
            worker_count: 3,
        };
        let err = RunConfig::new(&args, Config::default()).unwrap_err();
        assert!(err.to_string().contains("workerIndex must be less than workerCount"));
    }

    #[test]
    fn test_run_config_rejects_bad_config() {
        let args = RunArgs {
            input: "shards.txt".to_string(),
            worker_index: 0,
            worker_count: 1,
        };
        let mut config = Config::default();
        config.tools.publish.args.push("{nope}".to_string());
        assert!(RunConfig::new(&args, config).is_err());
    }

    #[test]
    fn test_plan() {
        let list = ShardList::parse("Go/a.parquet\nGo/b.parquet\n\nbad.parquet\nRust/c.parquet\n");
        let assignment = WorkAssignment::new(0, 2).unwrap();

        let items = plan(&list, assignment);

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].description, "Go/a.parquet");
        assert_eq!(items[1].description, "(blank)");
        assert_eq!(items[2].position, 4);
        assert_eq!(items[2].description, "Rust/c.parquet");

        let odd = plan(&list, WorkAssignment::new(1, 2).unwrap());
        assert!(odd[1].description.starts_with("(invalid"));
    }

    #[test]
    fn test_build_runtime() {
        let runtime = build_runtime(Some(2)).unwrap();
        assert_eq!(runtime.block_on(async { 1 + 1 }), 2);
    }
}
