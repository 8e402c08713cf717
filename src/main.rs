//! Shard Convert CLI
//!
//! Runs one worker of a shard conversion job over its share of a shard list.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shard_convert::io::raw_root;
use shard_convert::{
    build_runtime, completion_checker, plan, run_worker, Config, RunArgs, RunConfig,
    ShardDescriptor, ShardList, TokioProcessRunner,
};

/// Exit code after a second Ctrl-C (128 + SIGINT).
const EXIT_ABORTED: i32 = 130;

#[derive(Parser)]
#[command(name = "shard-convert", version)]
#[command(about = "Convert dataset shards into compressed JSONL, one worker at a time", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process this worker's share of the shard list
    Run(WorkerArgs),

    /// Show the shards this worker would process, without running anything
    Plan(WorkerArgs),

    /// Check whether a shard's output is fully published
    Check {
        /// Shard path relative to the raw tree, e.g. Python/train-00000-of-00001.parquet
        shard: String,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Shard list: local file or s3:// URI, one `<group>/<shard-file>` per line
    input_file: String,

    /// Zero-based index of this worker
    #[arg(allow_negative_numbers = true)]
    worker_index: i64,

    /// Total number of workers
    #[arg(allow_negative_numbers = true)]
    worker_count: i64,
}

impl From<WorkerArgs> for RunArgs {
    fn from(args: WorkerArgs) -> Self {
        RunArgs {
            input: args.input_file,
            worker_index: args.worker_index,
            worker_count: args.worker_count,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Usage errors exit with 1; help and version exit with 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => run_command(config_path, args.into())?,
        Commands::Plan(args) => plan_command(config_path, args.into())?,
        Commands::Check { shard } => check_command(config_path, &shard)?,
        Commands::Validate => validate_command(config_path)?,
        Commands::GenerateConfig { output } => generate_config_command(output)?,
    }

    Ok(())
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn run_command(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let worker_threads = config.processing.worker_threads;
    let run = RunConfig::new(&args, config)?;

    let runtime = build_runtime(worker_threads)?;
    let stats = runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("Interrupt received, stopping after the current shard (Ctrl-C again to abort)");
            let _ = shutdown_tx.send(true);

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("Second interrupt received, aborting");
                std::process::exit(EXIT_ABORTED);
            }
        });

        run_worker(run, Arc::new(TokioProcessRunner), shutdown_rx).await
    })?;

    println!("{}", stats);

    Ok(())
}

fn plan_command(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let run = RunConfig::new(&args, config)?;

    let runtime = build_runtime(None)?;
    let list = runtime.block_on(ShardList::load(&run.input))?;
    let items = plan(&list, run.assignment);

    println!("\n=== Work Plan ===");
    println!("Worker: {}", run.assignment);
    println!("Shard list: {} ({} lines)", run.input, list.len());
    println!("Assigned: {}", items.len());
    println!("Raw shards: {}", raw_root(&run.config.layout).display());
    println!("Remote raw data: {}", run.config.remote.raw_root_key());
    println!("Remote output: {}", run.config.remote.output_uri("<group>"));
    println!();
    for item in &items {
        println!("{}", item);
    }
    println!("=================\n");

    Ok(())
}

fn check_command(config_path: Option<&Path>, shard: &str) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    let shard = ShardDescriptor::parse(0, shard)?;
    let checker = completion_checker(&config)?
        .context("No remote configured: set remote.bucket or remote.local_path")?;

    let runtime = build_runtime(None)?;
    let status = runtime.block_on(checker.check(&shard))?;

    tracing::info!("{}: {} published", shard.label(), status);
    println!("{}", status.is_complete());

    Ok(())
}

fn validate_command(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Shard Convert Configuration

# === LAYOUT: Local working directories ===
layout:
  # Fast local volume (e.g. a RAID0 of instance-store NVMe disks)
  staging_root: "/mnt/raid0"

  # Dataset name; raw shards live in <staging_root>/<dataset>/raw-<raw_source>
  dataset: "the-stack-v2"
  raw_source: "hf-parquets"

  # Transformed output goes to <staging_root>/<output_dir>/<group>
  output_dir: "jsonls"

# === REMOTE: Where output is published ===
# Choose ONE of: bucket (S3) OR local_path (local directory)
remote:
  bucket: "ai2-llm"
  # local_path: "/tmp/shard-convert-remote"

  prefix: "pretraining-data/sources/the-stack-v2"
  raw_subdir: "raw-hf-parquets"
  output_subdir: "jsonl_data"

  # Suffix of produced output parts (used to detect published shards)
  output_suffix: ".jsonl.zstd"

# === TOOLS: External programs run for each shard ===
# Placeholders: {manifest} {metadata} {blob_dir} {output_dir} {remote} {group} {shard}
tools:
  fetch:
    program: "s5cmd"
    args: ["run", "{manifest}"]
    timeout_secs: 3600

  transform:
    program: "stack-jsonl"
    args: ["collect", "--metadata", "{metadata}", "--blob-dir", "{blob_dir}", "--output-dir", "{output_dir}"]
    # Exit codes that mean "try again" (transform failures are final otherwise)
    retryable_exit_codes: []

  publish:
    program: "s5cmd"
    args: ["sync", "{output_dir}/", "{remote}/"]
    timeout_secs: 3600

# === PROCESSING ===
processing:
  # Tokio worker threads (null = num CPUs)
  # worker_threads: 4

  # Skip shards whose output is already fully published
  skip_completed: false

  # Print a progress line to stderr after every shard
  enable_progress: true
  progress_bar_width: 40

  # Print the stage breakdown and cleanup warnings at the end of the run
  enable_summary: true

  # Save metrics JSON after the run
  # metrics_output_path: "metrics.json"

  # Retry configuration for transient fetch/publish failures
  retry:
    max_retries: 3
    initial_backoff_ms: 1000
    max_backoff_ms: 60000
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["shard-convert", "run", "shards.txt", "1", "4"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.input_file, "shards.txt");
                assert_eq!(args.worker_index, 1);
                assert_eq!(args.worker_count, 4);
            }
            _ => panic!("expected run"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_negative_worker_count() {
        // Parsed, then rejected with a descriptive error
        let cli = Cli::try_parse_from(["shard-convert", "run", "shards.txt", "0", "-1"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let args: RunArgs = args.into();
        let err = RunConfig::new(&args, Config::default()).unwrap_err();
        assert!(err.to_string().contains("workerCount must be positive"));
    }

    #[test]
    fn test_cli_missing_arguments() {
        let err = Cli::try_parse_from(["shard-convert", "run", "shards.txt"]).err().unwrap();
        assert!(err.use_stderr());
        assert!(Cli::try_parse_from(["shard-convert"]).is_err());
    }

    #[test]
    fn test_cli_help_is_not_an_error_exit() {
        let err = Cli::try_parse_from(["shard-convert", "--help"]).err().unwrap();
        assert!(!err.use_stderr());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["shard-convert", "plan", "s3://bucket/shards.txt", "0", "2", "-c", "other.yaml"]);
        assert!(cli.is_ok());
        assert_eq!(cli.unwrap().config, Some(PathBuf::from("other.yaml")));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["shard-convert", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        generate_config_command(path.clone()).unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tools.fetch.program, "s5cmd");
        assert_eq!(config.processing.retry.max_retries, 3);
    }
}
