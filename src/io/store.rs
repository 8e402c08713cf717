//! Object store access for the shard list and the published output tree.
//!
//! Publishing itself goes through the bulk-sync tool; the store is only used
//! to read an `s3://` shard list and to list what has already been published.

use crate::config::RemoteConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Split `s3://bucket/key` into bucket and key.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Not an S3 URI (missing 's3://'): '{}'", uri))?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => anyhow::bail!("Expected 's3://<bucket>/<key>', got '{}'", uri),
    }
}

/// Listing a group prefix and reading one shard list are small requests;
/// fail fast rather than hold the worker.
fn listing_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(60))
}

/// Retries for throttling (503 Slow Down) and transient 5xx.
fn listing_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 4,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// S3 client for `bucket`, with credentials and region from the environment,
/// AWS config files or the instance profile.
fn s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::debug!("Connecting to S3 bucket {}", bucket);

    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(listing_client_options())
        .with_retry(listing_retry_config())
        .build()
        .with_context(|| format!("Failed to create S3 client for bucket {}", bucket))?;

    Ok(Arc::new(store))
}

/// Create a store and object path for an `s3://bucket/key` URI.
pub fn create_store_for_uri(uri: &str) -> Result<(Arc<dyn ObjectStore>, StorePath)> {
    let (bucket, key) = parse_s3_uri(uri)?;
    Ok((s3_store(bucket)?, StorePath::from(key)))
}

/// Store rooted at the remote tree: a local directory when `local_path` is
/// set, otherwise the S3 bucket. `None` when neither is configured.
pub fn create_remote_store(remote: &RemoteConfig) -> Result<Option<Arc<dyn ObjectStore>>> {
    if let Some(local_path) = &remote.local_path {
        std::fs::create_dir_all(local_path)
            .with_context(|| format!("Failed to create remote directory {}", local_path))?;
        tracing::info!("Using local directory {} as the remote", local_path);
        return Ok(Some(Arc::new(LocalFileSystem::new_with_prefix(local_path)?)));
    }

    remote.bucket.as_deref().map(s3_store).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_store_builds_without_network() {
        assert!(s3_store("ai2-llm").is_ok());
    }

    #[test]
    fn test_create_store_for_uri() {
        let (_, path) = create_store_for_uri("s3://ai2-llm/lists/shards.txt").unwrap();
        assert_eq!(path.as_ref(), "lists/shards.txt");
        assert!(create_store_for_uri("/local/shards.txt").is_err());
    }

    #[test]
    fn test_create_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteConfig {
            local_path: Some(dir.path().join("remote").display().to_string()),
            bucket: None,
            ..RemoteConfig::default()
        };
        let store = create_remote_store(&remote).unwrap();
        assert!(store.is_some());
        assert!(dir.path().join("remote").is_dir());
    }

    #[test]
    fn test_no_remote() {
        let remote = RemoteConfig {
            bucket: None,
            ..RemoteConfig::default()
        };
        assert!(create_remote_store(&remote).unwrap().is_none());
    }

    #[test]
    fn test_parse_s3_uri() {
        assert_eq!(
            parse_s3_uri("s3://ai2-llm/pretraining-data/sources/the-stack-v2/shards.txt").unwrap(),
            ("ai2-llm", "pretraining-data/sources/the-stack-v2/shards.txt")
        );

        assert!(parse_s3_uri("ai2-llm/shards.txt").is_err());
        assert!(parse_s3_uri("gs://ai2-llm/shards.txt").is_err());
        assert!(parse_s3_uri("s3://ai2-llm").is_err());
        assert!(parse_s3_uri("s3://ai2-llm/").is_err());
        assert!(parse_s3_uri("s3:///shards.txt").is_err());
    }
}
