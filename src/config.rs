//! Configuration for the shard conversion worker.

use crate::error::ShardError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the conversion worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local directory layout
    #[serde(default)]
    pub layout: LayoutConfig,

    /// Remote store layout
    #[serde(default)]
    pub remote: RemoteConfig,

    /// External tool invocations
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Local staging layout.
///
/// ```text
/// <staging_root>/<dataset>/raw-<raw_source>/<group>/<shard>   shard metadata + manifest
/// <staging_root>/<dataset>/data/<group>/                       fetched blobs
/// <staging_root>/<output_dir>/<group>/                         transformed output
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Fast local volume holding all working directories
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,

    /// Dataset name
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Source tag of the raw shard tree (`raw-<source>`)
    #[serde(default = "default_raw_source")]
    pub raw_source: String,

    /// Directory name for transformed output under the staging root
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            dataset: default_dataset(),
            raw_source: default_raw_source(),
            output_dir: default_output_dir(),
        }
    }
}

/// Remote store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Local filesystem directory used as the remote store.
    /// Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket
    #[serde(default = "default_bucket")]
    pub bucket: Option<String>,

    /// Key prefix under which the dataset lives
    #[serde(default = "default_remote_prefix")]
    pub prefix: String,

    /// Subtree holding raw shard data
    #[serde(default = "default_raw_subdir")]
    pub raw_subdir: String,

    /// Subtree holding produced output
    #[serde(default = "default_output_subdir")]
    pub output_subdir: String,

    /// File suffix of produced output parts
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            local_path: None,
            bucket: default_bucket(),
            prefix: default_remote_prefix(),
            raw_subdir: default_raw_subdir(),
            output_subdir: default_output_subdir(),
            output_suffix: default_output_suffix(),
        }
    }
}

impl RemoteConfig {
    /// Check if the remote store is a local directory.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Key of the output subtree relative to the store root.
    pub fn output_root_key(&self) -> String {
        join_key(&[&self.prefix, &self.output_subdir])
    }

    /// Key of the raw subtree relative to the store root.
    pub fn raw_root_key(&self) -> String {
        join_key(&[&self.prefix, &self.raw_subdir])
    }

    /// Destination handed to the sync tool for a group's output.
    pub fn output_uri(&self, group: &str) -> String {
        let key = join_key(&[&self.output_root_key(), group]);
        match (&self.local_path, &self.bucket) {
            (Some(local), _) => Path::new(local).join(key).display().to_string(),
            (None, Some(bucket)) => format!("s3://{}/{}", bucket, key),
            (None, None) => key,
        }
    }
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// One external tool invocation.
///
/// `args` may contain the placeholders listed in [`PLACEHOLDERS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,

    /// Argument template
    #[serde(default)]
    pub args: Vec<String>,

    /// Kill the tool after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Exit codes that indicate a transient failure
    #[serde(default)]
    pub retryable_exit_codes: Vec<i32>,
}

/// Placeholders accepted in tool argument templates.
pub const PLACEHOLDERS: &[&str] = &[
    "manifest",
    "metadata",
    "blob_dir",
    "output_dir",
    "remote",
    "group",
    "shard",
];

impl CommandSpec {
    fn new(program: &str, args: &[&str], timeout_secs: Option<u64>) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs,
            retryable_exit_codes: Vec::new(),
        }
    }

    /// Check that every placeholder in `args` is known.
    pub fn validate(&self, tool: &str) -> Result<(), ShardError> {
        if self.program.trim().is_empty() {
            return Err(ShardError::argument(format!("{} program must not be empty", tool)));
        }
        for arg in &self.args {
            for name in placeholders_in(arg) {
                if !PLACEHOLDERS.contains(&name) {
                    return Err(ShardError::Template {
                        tool: tool.to_string(),
                        placeholder: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Iterate over `{name}` placeholders in a template string.
pub(crate) fn placeholders_in(template: &str) -> impl Iterator<Item = &str> {
    template.split('{').skip(1).filter_map(|rest| rest.split_once('}').map(|(name, _)| name))
}

/// External tools used by the pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Bulk-fetch tool run in batch mode against a shard manifest
    #[serde(default = "default_fetch_tool")]
    pub fetch: CommandSpec,

    /// Transformer joining shard metadata with fetched blobs
    #[serde(default = "default_transform_tool")]
    pub transform: CommandSpec,

    /// Bulk-sync tool mirroring output to the remote store
    #[serde(default = "default_publish_tool")]
    pub publish: CommandSpec,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_tool(),
            transform: default_transform_tool(),
            publish: default_publish_tool(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Retry configuration for transient tool failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Skip shards whose output is already fully published
    #[serde(default)]
    pub skip_completed: bool,

    /// Print a progress line after every shard
    #[serde(default = "default_true")]
    pub enable_progress: bool,

    /// Print the end-of-run summary to stdout
    #[serde(default = "default_true")]
    pub enable_summary: bool,

    /// Width of the progress bar in characters
    #[serde(default = "default_progress_bar_width")]
    pub progress_bar_width: usize,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            retry: RetryConfig::default(),
            skip_completed: false,
            enable_progress: true,
            enable_summary: true,
            progress_bar_width: default_progress_bar_width(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// anything else as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;

        let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
        .with_context(|| format!("Cannot parse {}", path.display()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.remote.local_path.is_some() && self.remote.bucket.is_some() {
            anyhow::bail!("Cannot specify both remote.local_path and remote.bucket");
        }
        if self.layout.dataset.is_empty() || self.layout.output_dir.is_empty() {
            anyhow::bail!("layout.dataset and layout.output_dir must not be empty");
        }

        self.tools.fetch.validate("fetch")?;
        self.tools.transform.validate("transform")?;
        self.tools.publish.validate("publish")?;

        let retry = &self.processing.retry;
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            anyhow::bail!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }
        if self.processing.progress_bar_width == 0 {
            anyhow::bail!("Progress bar width must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_staging_root() -> PathBuf { PathBuf::from("/mnt/raid0") }
fn default_dataset() -> String { "the-stack-v2".to_string() }
fn default_raw_source() -> String { "hf-parquets".to_string() }
fn default_output_dir() -> String { "jsonls".to_string() }
fn default_bucket() -> Option<String> { Some("ai2-llm".to_string()) }
fn default_remote_prefix() -> String { "pretraining-data/sources/the-stack-v2".to_string() }
fn default_raw_subdir() -> String { "raw-hf-parquets".to_string() }
fn default_output_subdir() -> String { "jsonl_data".to_string() }
fn default_output_suffix() -> String { ".jsonl.zstd".to_string() }
fn default_true() -> bool { true }
fn default_progress_bar_width() -> usize { 40 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 60_000 }

fn default_fetch_tool() -> CommandSpec {
    CommandSpec::new("s5cmd", &["run", "{manifest}"], Some(3600))
}

fn default_transform_tool() -> CommandSpec {
    CommandSpec::new(
        "stack-jsonl",
        &[
            "collect",
            "--metadata",
            "{metadata}",
            "--blob-dir",
            "{blob_dir}",
            "--output-dir",
            "{output_dir}",
        ],
        None,
    )
}

fn default_publish_tool() -> CommandSpec {
    CommandSpec::new("s5cmd", &["sync", "{output_dir}/", "{remote}/"], Some(3600))
}
