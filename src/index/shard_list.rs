//! Load the newline-delimited shard list.
//!
//! Every line of the input file occupies one partition position, including
//! blank lines, so all workers agree on positions without having to agree
//! on which lines are meaningful.

use crate::error::{Result, ShardError};
use anyhow::Context;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Manifest file extension that replaces the shard's own extension.
const MANIFEST_EXTENSION: &str = "cmd.txt";

/// One unit of work: a shard metadata file and its companion manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    /// Zero-based line position in the input list
    pub position: usize,

    /// Path relative to the raw tree, `<group>/<shard-file>`
    pub relative_path: PathBuf,

    /// Group (immediate parent directory of the shard)
    pub group: String,

    /// Manifest path relative to the raw tree, `<group>/<stem>.cmd.txt`
    pub manifest_path: PathBuf,
}

impl ShardDescriptor {
    /// Parse one input line.
    pub fn parse(position: usize, line: &str) -> Result<Self> {
        let invalid = |reason: &str| ShardError::InvalidShardPath {
            line: position + 1,
            reason: reason.to_string(),
        };

        let relative_path = PathBuf::from(line.trim());
        if relative_path.is_absolute() {
            return Err(invalid("expected a path relative to the raw tree"));
        }
        if relative_path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(invalid("'..' is not allowed in shard paths"));
        }

        let file_name = relative_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("missing shard file name"))?;
        if file_name.starts_with('.') || !file_name.contains('.') {
            return Err(invalid("shard file name must have an extension"));
        }

        let group = relative_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("expected <group>/<shard-file>"))?
            .to_string();

        let manifest_path = relative_path.with_extension(MANIFEST_EXTENSION);

        Ok(Self {
            position,
            relative_path,
            group,
            manifest_path,
        })
    }

    /// Label used in logs and progress output.
    pub fn label(&self) -> String {
        self.relative_path.display().to_string()
    }

    /// Shard file stem (`train-00000-of-00001` for `train-00000-of-00001.parquet`).
    pub fn stem(&self) -> &str {
        self.relative_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    /// Shard number within its group.
    ///
    /// Second `-`-separated token of the stem (`00000` in
    /// `train-00000-of-00001`), or the whole stem if there is none.
    pub fn tag(&self) -> &str {
        let stem = self.stem();
        stem.split('-').nth(1).filter(|t| !t.is_empty()).unwrap_or(stem)
    }
}

/// One line of the shard list.
#[derive(Debug)]
pub enum ShardEntry {
    /// A parsed shard
    Shard(ShardDescriptor),

    /// Empty or whitespace-only line
    Blank,

    /// Line that could not be parsed
    Invalid(ShardError),
}

/// The full, ordered shard list shared by all workers.
#[derive(Debug, Default)]
pub struct ShardList {
    entries: Vec<ShardEntry>,
}

impl ShardList {
    /// Load the shard list from a local path or an `s3://` URI.
    pub async fn load(location: &str) -> anyhow::Result<Self> {
        if location.starts_with("s3://") {
            let (store, path) = crate::io::create_store_for_uri(location)?;
            Self::from_store(store, &path).await
        } else {
            Self::from_file(Path::new(location))
        }
    }

    /// Load the shard list from an object store.
    pub async fn from_store(
        store: Arc<dyn ObjectStore>,
        path: &object_store::path::Path,
    ) -> anyhow::Result<Self> {
        let bytes = store
            .get(path)
            .await
            .with_context(|| format!("Failed to fetch shard list: {}", path))?
            .bytes()
            .await?;
        let contents = std::str::from_utf8(&bytes).context("Shard list is not valid UTF-8")?;
        let list = Self::parse(contents);

        tracing::info!("Loaded {} lines from shard list {}", list.len(), path);

        Ok(list)
    }

    /// Load the shard list from a local file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read shard list: {}", path.display()))?;
        let list = Self::parse(&contents);

        tracing::info!("Loaded {} lines from shard list {}", list.len(), path.display());

        Ok(list)
    }

    /// Parse shard list contents.
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .enumerate()
            .map(|(position, line)| {
                if line.trim().is_empty() {
                    ShardEntry::Blank
                } else {
                    match ShardDescriptor::parse(position, line) {
                        Ok(shard) => ShardEntry::Shard(shard),
                        Err(e) => ShardEntry::Invalid(e),
                    }
                }
            })
            .collect();

        Self { entries }
    }

    /// Total number of lines (partition positions).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in input order.
    pub fn entries(&self) -> &[ShardEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let shard = ShardDescriptor::parse(4, "Python/train-00012-of-00030.parquet").unwrap();
        assert_eq!(shard.position, 4);
        assert_eq!(shard.group, "Python");
        assert_eq!(
            shard.manifest_path,
            PathBuf::from("Python/train-00012-of-00030.cmd.txt")
        );
        assert_eq!(shard.stem(), "train-00012-of-00030");
        assert_eq!(shard.tag(), "00012");
        assert_eq!(shard.label(), "Python/train-00012-of-00030.parquet");
    }

    #[test]
    fn test_tag_without_dashes() {
        let shard = ShardDescriptor::parse(0, "C/part.parquet").unwrap();
        assert_eq!(shard.tag(), "part");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let shard = ShardDescriptor::parse(0, "  Go/train-00000-of-00001.parquet \r").unwrap();
        assert_eq!(shard.group, "Go");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(ShardDescriptor::parse(0, "train-00000.parquet").is_err());
        assert!(ShardDescriptor::parse(0, "/abs/Go/x.parquet").is_err());
        assert!(ShardDescriptor::parse(0, "Go/../x.parquet").is_err());
        assert!(ShardDescriptor::parse(0, "Go/noext").is_err());

        let err = ShardDescriptor::parse(6, "x.parquet").unwrap_err();
        assert!(err.to_string().contains("line 7"));
    }

    #[test]
    fn test_blank_lines_consume_positions() {
        let list = ShardList::parse("a/1.parquet\n\n  \nb/2.parquet\n");
        assert_eq!(list.len(), 4);
        assert!(matches!(list.entries()[1], ShardEntry::Blank));
        assert!(matches!(list.entries()[2], ShardEntry::Blank));
        match &list.entries()[3] {
            ShardEntry::Shard(shard) => assert_eq!(shard.position, 3),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_empty_list() {
        let list = ShardList::parse("");
        assert!(list.is_empty());
    }

    #[test]
    fn test_invalid_line_is_kept() {
        let list = ShardList::parse("nogroup.parquet\nGo/a.parquet");
        assert_eq!(list.len(), 2);
        assert!(matches!(list.entries()[0], ShardEntry::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_local_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shards.txt");
        std::fs::write(&file, "Go/a.parquet\nGo/b.parquet\n").unwrap();

        let list = ShardList::load(&file.display().to_string()).await.unwrap();
        assert_eq!(list.len(), 2);

        let store: Arc<dyn ObjectStore> =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let list = ShardList::from_store(store, &object_store::path::Path::from("shards.txt"))
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_from_file_missing() {
        let err = ShardList::from_file(Path::new("/nonexistent/shards.txt")).unwrap_err();
        assert!(err.to_string().contains("Failed to read shard list"));
    }
}
