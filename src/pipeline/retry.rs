//! Bounded retry with exponential backoff for transient tool failures.

use crate::config::RetryConfig;
use crate::error::{Result, ShardError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Retry policy built from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            shutdown: None,
        }
    }

    /// Stop retrying once `shutdown` is raised; the last error is returned.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `backoff`, waking early on shutdown.
    async fn pause(&self, backoff: Duration) {
        let Some(shutdown) = &self.shutdown else {
            tokio::time::sleep(backoff).await;
            return;
        };

        let mut shutdown = shutdown.clone();
        let raised = async move {
            // A dropped sender can never raise shutdown
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = raised => {}
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Backoff before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(31) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails fatally, retries are exhausted or
    /// shutdown is raised.
    ///
    /// `on_retry` is called with the retry number and the error before each
    /// backoff sleep.
    pub async fn run<T, F, Fut, R>(&self, label: &str, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(usize, &ShardError),
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.stopping() => {
                    tracing::warn!("{} failed during shutdown, not retrying: {}", label, e);
                    return Err(e);
                }
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let backoff = self.backoff(retry);
                    tracing::warn!(
                        "{} attempt {} failed: {}, retrying in {}ms",
                        label,
                        retry,
                        e,
                        backoff.as_millis()
                    );
                    on_retry(retry, &e);
                    self.pause(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use std::cell::Cell;

    fn transient() -> ShardError {
        ShardError::ToolFailed {
            stage: Stage::Fetch,
            code: Some(1),
            stderr: "503 Slow Down".to_string(),
            retryable: true,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let mut retries = Vec::new();

        let result = policy
            .run(
                "fetch",
                || {
                    calls.set(calls.get() + 1);
                    let attempt = calls.get();
                    async move {
                        if attempt < 3 {
                            Err(transient())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |retry, _| retries.push(retry),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<()> = policy
            .run(
                "publish",
                || {
                    calls.set(calls.get() + 1);
                    async { Err(transient()) }
                },
                |_, _| {},
            )
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<()> = policy
            .run(
                "transform",
                || {
                    calls.set(calls.get() + 1);
                    async {
                        Err(ShardError::TransformOutputMissing {
                            dir: "/tmp/out".into(),
                        })
                    }
                },
                |_, _| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_after_shutdown() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1))
            .with_shutdown(rx);
        let calls = Cell::new(0);

        let result: Result<()> = policy
            .run(
                "fetch",
                || {
                    calls.set(calls.get() + 1);
                    // The tool is killed by the same interrupt
                    let _ = tx.send(true);
                    async { Err(transient()) }
                },
                |_, _| {},
            )
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_backoff_short() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::new(1, Duration::from_secs(600), Duration::from_secs(600))
            .with_shutdown(rx);
        let calls = Cell::new(0);

        let run = policy.run(
            "publish",
            || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(transient()) }
            },
            |_, _| {
                let _ = tx.send(true);
            },
        );
        let result = tokio::time::timeout(Duration::from_secs(5), run).await;

        assert!(result.expect("backoff should end on shutdown").is_err());
        assert_eq!(calls.get(), 2);
    }
}
