//! Check whether a shard's output has already been fully published.
//!
//! Output parts are named `<group>-<tag>…-of-<N><suffix>`; a shard is
//! complete when all `N` parts are present under its group's output prefix.

use crate::index::ShardDescriptor;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use std::sync::Arc;

/// Result of a completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    /// Matching output parts found
    pub found: usize,

    /// Total parts announced by the part names
    pub expected: Option<usize>,
}

impl CompletionStatus {
    pub fn is_complete(&self) -> bool {
        self.found > 0 && self.expected == Some(self.found)
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.expected {
            Some(expected) => write!(f, "{}/{} parts", self.found, expected),
            None => write!(f, "{} parts", self.found),
        }
    }
}

/// Lists published output for shards.
pub struct CompletionChecker {
    store: Arc<dyn ObjectStore>,
    output_root: String,
    suffix: String,
}

impl CompletionChecker {
    /// Create a checker over `output_root` (key relative to the store root).
    pub fn new(store: Arc<dyn ObjectStore>, output_root: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            store,
            output_root: output_root.into(),
            suffix: suffix.into(),
        }
    }

    /// List the shard's published parts.
    pub async fn check(&self, shard: &ShardDescriptor) -> anyhow::Result<CompletionStatus> {
        let prefix = StorePath::from(format!("{}/{}", self.output_root, shard.group));
        let part_prefix = format!("{}-{}", shard.group, shard.tag());

        let objects = match self.store.list(Some(&prefix)).try_collect::<Vec<_>>().await {
            Ok(objects) => objects,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let names: Vec<&str> = objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter(|name| name.starts_with(&part_prefix) && name.ends_with(&self.suffix))
            .collect();

        // Every part carries the same total; one is enough
        let expected = match names.first() {
            Some(name) => {
                let total = parse_total_parts(name, &self.suffix);
                if total.is_none() {
                    tracing::warn!("Cannot read part count from output name {}", name);
                }
                total
            }
            None => None,
        };

        Ok(CompletionStatus {
            found: names.len(),
            expected,
        })
    }

    /// Whether the shard is fully published. Listing errors count as incomplete.
    pub async fn is_complete(&self, shard: &ShardDescriptor) -> bool {
        match self.check(shard).await {
            Ok(status) => {
                tracing::debug!("{}: {} published", shard.label(), status);
                status.is_complete()
            }
            Err(e) => {
                tracing::warn!("Completion check failed for {}: {}", shard.label(), e);
                false
            }
        }
    }
}

/// Parse `N` from `…-of-N<suffix>`.
fn parse_total_parts(name: &str, suffix: &str) -> Option<usize> {
    let stem = name.strip_suffix(suffix)?;
    let (_, total) = stem.rsplit_once("-of-")?;
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;

    const SUFFIX: &str = ".jsonl.zstd";

    fn write_parts(root: &std::path::Path, group: &str, names: &[&str]) {
        let dir = root.join("jsonl_data").join(group);
        std::fs::create_dir_all(&dir).unwrap();
        for name in names {
            std::fs::write(dir.join(name), b"{}").unwrap();
        }
    }

    fn checker(root: &std::path::Path) -> CompletionChecker {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(root).unwrap());
        CompletionChecker::new(store, "jsonl_data", SUFFIX)
    }

    #[test]
    fn test_parse_total_parts() {
        assert_eq!(parse_total_parts("Go-00000-0001-of-0003.jsonl.zstd", SUFFIX), Some(3));
        assert_eq!(parse_total_parts("Go-00000.jsonl.zstd", SUFFIX), None);
        assert_eq!(parse_total_parts("Go-00000-of-x.jsonl.zstd", SUFFIX), None);
        assert_eq!(parse_total_parts("Go-00000-of-3.jsonl.gz", SUFFIX), None);
    }

    #[tokio::test]
    async fn test_complete_shard() {
        let dir = tempfile::tempdir().unwrap();
        write_parts(
            dir.path(),
            "Go",
            &[
                "Go-00001-0000-of-0002.jsonl.zstd",
                "Go-00001-0001-of-0002.jsonl.zstd",
                // Another shard of the same group
                "Go-00002-0000-of-0001.jsonl.zstd",
            ],
        );
        let shard = ShardDescriptor::parse(0, "Go/train-00001-of-00004.parquet").unwrap();

        let status = checker(dir.path()).check(&shard).await.unwrap();
        assert_eq!(status, CompletionStatus { found: 2, expected: Some(2) });
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn test_partial_shard() {
        let dir = tempfile::tempdir().unwrap();
        write_parts(dir.path(), "Go", &["Go-00001-0000-of-0003.jsonl.zstd"]);
        let shard = ShardDescriptor::parse(0, "Go/train-00001-of-00004.parquet").unwrap();

        let checker = checker(dir.path());
        let status = checker.check(&shard).await.unwrap();
        assert_eq!(status.found, 1);
        assert!(!status.is_complete());
        assert!(!checker.is_complete(&shard).await);
    }

    #[tokio::test]
    async fn test_nothing_published() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardDescriptor::parse(0, "Zig/train-00000-of-00001.parquet").unwrap();

        let status = checker(dir.path()).check(&shard).await.unwrap();
        assert_eq!(status.found, 0);
        assert!(!status.is_complete());
    }
}
