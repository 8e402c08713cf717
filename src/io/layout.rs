//! Local and remote paths for a shard.

use crate::config::{LayoutConfig, RemoteConfig};
use crate::index::ShardDescriptor;
use std::path::{Path, PathBuf};

/// Resolved working paths for one shard.
///
/// `blob_dir` and `output_dir` are per-group and exclusively owned by the
/// shard being processed; both are removed once the shard finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPaths {
    pub metadata: PathBuf,
    pub manifest: PathBuf,
    pub blob_dir: PathBuf,
    pub output_dir: PathBuf,
    pub remote: String,
    pub group: String,
    pub shard: String,
}

impl ShardPaths {
    pub fn new(layout: &LayoutConfig, remote: &RemoteConfig, shard: &ShardDescriptor) -> Self {
        let raw_root = raw_root(layout);
        Self {
            metadata: raw_root.join(&shard.relative_path),
            manifest: raw_root.join(&shard.manifest_path),
            blob_dir: layout
                .staging_root
                .join(&layout.dataset)
                .join("data")
                .join(&shard.group),
            output_dir: layout.staging_root.join(&layout.output_dir).join(&shard.group),
            remote: remote.output_uri(&shard.group),
            group: shard.group.clone(),
            shard: shard.label(),
        }
    }

    /// Value substituted for `{name}` in tool argument templates.
    pub fn placeholder(&self, name: &str) -> Option<String> {
        let value = match name {
            "manifest" => path_string(&self.manifest),
            "metadata" => path_string(&self.metadata),
            "blob_dir" => path_string(&self.blob_dir),
            "output_dir" => path_string(&self.output_dir),
            "remote" => self.remote.clone(),
            "group" => self.group.clone(),
            "shard" => self.shard.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Directories released by cleanup.
    pub fn working_dirs(&self) -> [&Path; 2] {
        [&self.blob_dir, &self.output_dir]
    }
}

/// Root of the raw shard tree: `<staging_root>/<dataset>/raw-<source>`.
pub fn raw_root(layout: &LayoutConfig) -> PathBuf {
    layout
        .staging_root
        .join(&layout.dataset)
        .join(format!("raw-{}", layout.raw_source))
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
