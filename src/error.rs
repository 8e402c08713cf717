//! Error types for shard processing.
//!
//! Shard-scoped failures are classified as retryable or fatal so the
//! pipeline can decide whether to back off and retry a stage or give up on
//! the shard and move on to the next one.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetch,
    Transform,
    Publish,
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Publish => "publish",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Whether a failed operation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Fatal,
}

/// Primary error type for shard operations.
#[derive(Debug, Error)]
pub enum ShardError {
    // ========== Invocation Errors ==========

    /// Bad command-line arguments
    #[error("{message}")]
    Argument { message: String },

    /// Tool argument template references an unknown placeholder
    #[error("Unknown placeholder {{{placeholder}}} in {tool} arguments")]
    Template { tool: String, placeholder: String },

    /// Input line could not be interpreted as `<group>/<shard-file>`
    #[error("Invalid shard path on line {line}: {reason}")]
    InvalidShardPath { line: usize, reason: String },

    // ========== Fetch Errors ==========

    /// Manifest for the shard does not exist
    #[error("Manifest not found: {}", .path.display())]
    ManifestMissing { path: PathBuf },

    /// Manifest exists but cannot be read
    #[error("Manifest unreadable: {}: {source}", .path.display())]
    ManifestUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ========== Tool Errors ==========

    /// External tool could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// External tool exited unsuccessfully
    #[error("{stage} tool exited with {}: {stderr}", exit_code_display(.code))]
    ToolFailed {
        stage: Stage,
        code: Option<i32>,
        stderr: String,
        retryable: bool,
    },

    /// External tool did not finish in time
    #[error("{stage} tool timed out after {limit:?}")]
    TimedOut { stage: Stage, limit: Duration },

    /// Transformer succeeded but left nothing in the output directory
    #[error("Transform produced no output in {}", .dir.display())]
    TransformOutputMissing { dir: PathBuf },

    // ========== Local Disk Errors ==========

    /// Could not prepare a local working directory
    #[error("Failed to prepare {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not remove a local working directory
    #[error("Failed to remove {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn exit_code_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl ShardError {
    /// Build an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        ShardError::Argument {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardError::ToolFailed { retryable: true, .. } => ErrorKind::Retryable,
            ShardError::TimedOut { stage, .. } if *stage != Stage::Transform => ErrorKind::Retryable,
            _ => ErrorKind::Fatal,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// The lifecycle stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ShardError::ManifestMissing { .. } | ShardError::ManifestUnreadable { .. } => {
                Some(Stage::Fetch)
            }
            ShardError::ToolFailed { stage, .. } | ShardError::TimedOut { stage, .. } => {
                Some(*stage)
            }
            ShardError::TransformOutputMissing { .. } => Some(Stage::Transform),
            ShardError::Cleanup { .. } => Some(Stage::Cleanup),
            _ => None,
        }
    }
}

/// Result type alias for shard operations
pub type Result<T> = std::result::Result<T, ShardError>;
