//! Per-shard lifecycle: fetch, transform, publish, cleanup.
//!
//! Stages run strictly in order for one shard at a time. Cleanup runs on
//! both the success and the failure path, so the per-group working
//! directories never outlive the shard that created them. A failed shard is
//! marked failed first and cleaned up best-effort afterwards.

use crate::config::{CommandSpec, Config};
use crate::error::{Result, ShardError, Stage};
use crate::index::ShardDescriptor;
use crate::io::{CompletionChecker, Invocation, ProcessRunner, ShardPaths};
use crate::pipeline::{Metrics, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lifecycle state of the shard being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Pending,
    Fetching,
    Transforming,
    Publishing,
    CleaningUp,
    Done,
    Failed,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardState::Pending => "pending",
            ShardState::Fetching => "fetching",
            ShardState::Transforming => "transforming",
            ShardState::Publishing => "publishing",
            ShardState::CleaningUp => "cleaning up",
            ShardState::Done => "done",
            ShardState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Time spent in each stage of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub fetch: Duration,
    pub transform: Duration,
    pub publish: Duration,
    pub cleanup: Duration,
}

impl StageTimings {
    fn record(&mut self, stage: Stage, elapsed: Duration) {
        match stage {
            Stage::Fetch => self.fetch = elapsed,
            Stage::Transform => self.transform = elapsed,
            Stage::Publish => self.publish = elapsed,
            Stage::Cleanup => self.cleanup = elapsed,
        }
    }
}

/// Why a shard was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Every output part is already present remotely
    AlreadyPublished,
}

/// Terminal result of processing one shard.
#[derive(Debug)]
pub enum ShardOutcome {
    /// All stages succeeded
    Done {
        timings: StageTimings,
        cleanup_ok: bool,
        states: Vec<ShardState>,
    },

    /// Nothing was run for the shard
    Skipped { reason: SkipReason },

    /// A stage failed; cleanup still ran
    Failed {
        stage: Stage,
        error: ShardError,
        cleanup_ok: bool,
        states: Vec<ShardState>,
    },
}

impl ShardOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ShardOutcome::Done { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ShardOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ShardOutcome::Failed { .. })
    }

    /// Whether the working directories were removed. Skipped shards never create any.
    pub fn cleanup_ok(&self) -> bool {
        match self {
            ShardOutcome::Done { cleanup_ok, .. } | ShardOutcome::Failed { cleanup_ok, .. } => {
                *cleanup_ok
            }
            ShardOutcome::Skipped { .. } => true,
        }
    }

    /// States the shard went through, in order. Empty for skipped shards.
    pub fn states(&self) -> &[ShardState] {
        match self {
            ShardOutcome::Done { states, .. } | ShardOutcome::Failed { states, .. } => states,
            ShardOutcome::Skipped { .. } => &[],
        }
    }
}

/// Records and logs the states of one shard.
struct Lifecycle<'a> {
    label: &'a str,
    states: Vec<ShardState>,
}

impl<'a> Lifecycle<'a> {
    fn new(label: &'a str) -> Self {
        let mut lifecycle = Self {
            label,
            states: Vec::new(),
        };
        lifecycle.enter(ShardState::Pending);
        lifecycle
    }

    fn enter(&mut self, state: ShardState) {
        tracing::debug!("{}: {}", self.label, state);
        self.states.push(state);
    }
}

/// Executes the shard lifecycle against the configured external tools.
pub struct ShardPipeline {
    config: Arc<Config>,
    runner: Arc<dyn ProcessRunner>,
    metrics: Arc<Metrics>,
    checker: Option<CompletionChecker>,
    retry: RetryPolicy,
}

impl ShardPipeline {
    pub fn new(config: Arc<Config>, runner: Arc<dyn ProcessRunner>, metrics: Arc<Metrics>) -> Self {
        let retry = RetryPolicy::from(&config.processing.retry);
        Self {
            config,
            runner,
            metrics,
            checker: None,
            retry,
        }
    }

    /// Give up retrying tool failures once `shutdown` is raised.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.retry = self.retry.with_shutdown(shutdown);
        self
    }

    /// Skip shards the checker reports as already published.
    pub fn with_completion_checker(mut self, checker: CompletionChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Resolve the local and remote paths of a shard.
    pub fn paths(&self, shard: &ShardDescriptor) -> ShardPaths {
        ShardPaths::new(&self.config.layout, &self.config.remote, shard)
    }

    /// Run one shard to a terminal state.
    pub async fn process(&self, shard: &ShardDescriptor) -> ShardOutcome {
        let label = shard.label();
        let mut lifecycle = Lifecycle::new(&label);

        if let Some(checker) = &self.checker {
            if checker.is_complete(shard).await {
                tracing::info!("{}: already published, skipping", label);
                self.metrics.add_shard_skipped();
                return ShardOutcome::Skipped {
                    reason: SkipReason::AlreadyPublished,
                };
            }
        }

        let paths = self.paths(shard);
        let mut timings = StageTimings::default();
        let result = self.run_stages(&mut lifecycle, &paths, &mut timings).await;

        if let Err((stage, error)) = &result {
            lifecycle.enter(ShardState::Failed);
            tracing::error!("{}: {} failed: {}", label, stage, error);
        }

        lifecycle.enter(ShardState::CleaningUp);
        let started = Instant::now();
        let cleanup_ok = self.cleanup(&label, &paths).await;
        timings.record(Stage::Cleanup, started.elapsed());
        self.metrics.add_stage_time(Stage::Cleanup, timings.cleanup);

        match result {
            Ok(()) => {
                lifecycle.enter(ShardState::Done);
                tracing::info!(
                    "{}: done (fetch {:.1}s, transform {:.1}s, publish {:.1}s)",
                    label,
                    timings.fetch.as_secs_f64(),
                    timings.transform.as_secs_f64(),
                    timings.publish.as_secs_f64()
                );
                self.metrics.add_shard_done();
                ShardOutcome::Done {
                    timings,
                    cleanup_ok,
                    states: lifecycle.states,
                }
            }
            Err((stage, error)) => {
                self.metrics.add_shard_failed();
                ShardOutcome::Failed {
                    stage,
                    error,
                    cleanup_ok,
                    states: lifecycle.states,
                }
            }
        }
    }

    async fn run_stages(
        &self,
        lifecycle: &mut Lifecycle<'_>,
        paths: &ShardPaths,
        timings: &mut StageTimings,
    ) -> std::result::Result<(), (Stage, ShardError)> {
        let stages = [
            (Stage::Fetch, ShardState::Fetching),
            (Stage::Transform, ShardState::Transforming),
            (Stage::Publish, ShardState::Publishing),
        ];

        let label = lifecycle.label;
        for (stage, state) in stages {
            lifecycle.enter(state);
            let started = Instant::now();
            let result = match stage {
                Stage::Fetch => self.fetch(label, paths).await,
                Stage::Transform => self.transform(label, paths).await,
                _ => self.publish(label, paths).await,
            };
            timings.record(stage, started.elapsed());
            self.metrics.add_stage_time(stage, started.elapsed());
            result.map_err(|e| (stage, e))?;
        }
        Ok(())
    }

    async fn fetch(&self, label: &str, paths: &ShardPaths) -> Result<()> {
        let manifest = match tokio::fs::read_to_string(&paths.manifest).await {
            Ok(manifest) => manifest,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShardError::ManifestMissing {
                    path: paths.manifest.clone(),
                });
            }
            Err(source) => {
                return Err(ShardError::ManifestUnreadable {
                    path: paths.manifest.clone(),
                    source,
                });
            }
        };

        let blobs = manifest.lines().filter(|l| !l.trim().is_empty()).count();
        if blobs == 0 {
            tracing::warn!("{}: manifest {} is empty", label, paths.manifest.display());
        } else {
            tracing::debug!("{}: manifest lists {} blobs", label, blobs);
        }

        recreate_dir(&paths.blob_dir).await?;
        self.run_tool(label, Stage::Fetch, &self.config.tools.fetch, paths).await
    }

    async fn transform(&self, label: &str, paths: &ShardPaths) -> Result<()> {
        recreate_dir(&paths.output_dir).await?;
        self.run_tool(label, Stage::Transform, &self.config.tools.transform, paths)
            .await?;

        if !has_entries(&paths.output_dir).await {
            return Err(ShardError::TransformOutputMissing {
                dir: paths.output_dir.clone(),
            });
        }
        Ok(())
    }

    async fn publish(&self, label: &str, paths: &ShardPaths) -> Result<()> {
        self.run_tool(label, Stage::Publish, &self.config.tools.publish, paths)
            .await
    }

    async fn run_tool(
        &self,
        label: &str,
        stage: Stage,
        command: &CommandSpec,
        paths: &ShardPaths,
    ) -> Result<()> {
        let invocation = Invocation::render(stage, command, paths)?;
        let retry_label = format!("{} {}", label, stage);

        self.retry
            .run(
                &retry_label,
                || self.invoke(&invocation, command),
                |_, _| self.metrics.add_retry(),
            )
            .await
    }

    async fn invoke(&self, invocation: &Invocation, command: &CommandSpec) -> Result<()> {
        let output = self.runner.run(invocation).await?;
        if output.is_success() {
            return Ok(());
        }

        // Only the transformer's failures are deterministic by default
        let retryable = match invocation.stage {
            Stage::Transform => output
                .code
                .is_some_and(|code| command.retryable_exit_codes.contains(&code)),
            _ => true,
        };

        Err(ShardError::ToolFailed {
            stage: invocation.stage,
            code: output.code,
            stderr: output.stderr,
            retryable,
        })
    }

    async fn cleanup(&self, label: &str, paths: &ShardPaths) -> bool {
        let mut ok = true;
        for dir in paths.working_dirs() {
            if let Err(e) = remove_dir(dir).await {
                tracing::warn!("{}: {}", label, e);
                self.metrics.add_cleanup_failure();
                ok = false;
            }
        }
        ok
    }
}

/// Remove a directory tree; a missing directory is already clean.
async fn remove_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ShardError::Cleanup {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Replace a directory with an empty one.
async fn recreate_dir(dir: &Path) -> Result<()> {
    let prepare = |source| ShardError::Prepare {
        path: dir.to_path_buf(),
        source,
    };

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::debug!("Removed stale directory {}", dir.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(prepare(e)),
    }
    tokio::fs::create_dir_all(dir).await.map_err(prepare)
}

async fn has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
