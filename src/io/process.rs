//! External tool execution.
//!
//! Every external collaborator (bulk fetch, transformer, bulk sync) is
//! reached through [`ProcessRunner`], so the pipeline can be driven by fakes
//! in tests.

use crate::config::{placeholders_in, CommandSpec};
use crate::error::{Result, ShardError, Stage};
use crate::io::ShardPaths;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Bytes of stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// A fully rendered tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Render a tool template against a shard's paths.
    pub fn render(stage: Stage, command: &CommandSpec, paths: &ShardPaths) -> Result<Self> {
        let args = command
            .args
            .iter()
            .map(|template| render_arg(stage, template, paths))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            stage,
            program: command.program.clone(),
            args,
            timeout: command.timeout_secs.map(Duration::from_secs),
        })
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn render_arg(stage: Stage, template: &str, paths: &ShardPaths) -> Result<String> {
    let mut rendered = template.to_string();
    for name in placeholders_in(template) {
        let value = paths.placeholder(name).ok_or_else(|| ShardError::Template {
            tool: stage.to_string(),
            placeholder: name.to_string(),
        })?;
        rendered = rendered.replace(&format!("{{{}}}", name), &value);
    }
    Ok(rendered)
}

/// Exit status and diagnostic output of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,

    /// Tail of the tool's stderr
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Capability to run an external tool to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the invocation, honoring its timeout.
    ///
    /// Returns `Err` only if the tool could not be started or timed out;
    /// a non-zero exit is reported through [`ProcessOutput::code`].
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// Runs tools as child processes of the worker.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        tracing::debug!("Running {} tool: {}", invocation.stage, invocation);

        let spawn_error = |source| ShardError::Spawn {
            program: invocation.program.clone(),
            source,
        };

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        // Drained concurrently so a chatty tool never blocks on a full pipe
        let stderr = child.stderr.take();
        let tail = tokio::spawn(async move {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL_BYTES).await,
                None => Vec::new(),
            }
        });

        let status = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.kill().await;
                    tail.abort();
                    return Err(ShardError::TimedOut {
                        stage: invocation.stage,
                        limit,
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(spawn_error)?;

        let stderr = tail.await.unwrap_or_default();

        Ok(ProcessOutput {
            code: status.code(),
            stderr: stderr_tail(&stderr),
        })
    }
}

/// Read `reader` to the end, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = VecDeque::with_capacity(limit);
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend(&buf[..n]);
                let excess = tail.len().saturating_sub(limit);
                tail.drain(..excess);
            }
        }
    }
    Vec::from(tail)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutConfig, RemoteConfig};
    use crate::index::ShardDescriptor;

    fn paths() -> ShardPaths {
        let shard = ShardDescriptor::parse(0, "Go/train-00001-of-00002.parquet").unwrap();
        ShardPaths::new(&LayoutConfig::default(), &RemoteConfig::default(), &shard)
    }

    #[test]
    fn test_render_default_fetch() {
        let command = crate::config::ToolsConfig::default().fetch;
        let invocation = Invocation::render(Stage::Fetch, &command, &paths()).unwrap();

        assert_eq!(invocation.program, "s5cmd");
        assert_eq!(invocation.args[0], "run");
        assert!(invocation.args[1].ends_with("Go/train-00001-of-00002.cmd.txt"));
        assert_eq!(invocation.timeout, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_render_publish_suffixes() {
        let command = crate::config::ToolsConfig::default().publish;
        let invocation = Invocation::render(Stage::Publish, &command, &paths()).unwrap();

        assert_eq!(invocation.args[1], "/mnt/raid0/jsonls/Go/");
        assert!(invocation.args[2].starts_with("s3://"));
        assert!(invocation.args[2].ends_with("jsonl_data/Go/"));
    }

    #[test]
    fn test_render_unknown_placeholder() {
        let command = CommandSpec {
            program: "tool".to_string(),
            args: vec!["{bogus}".to_string()],
            timeout_secs: None,
            retryable_exit_codes: vec![],
        };
        let err = Invocation::render(Stage::Transform, &command, &paths()).unwrap_err();
        assert!(matches!(err, ShardError::Template { .. }));
    }

    #[test]
    fn test_stderr_tail() {
        let long = vec![b'x'; STDERR_TAIL_BYTES + 100];
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_BYTES);
        assert_eq!(stderr_tail(b"  oops\n"), "oops");
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let invocation = Invocation {
            stage: Stage::Fetch,
            program: "/nonexistent/definitely-not-a-tool".to_string(),
            args: vec![],
            timeout: None,
        };
        let err = TokioProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, ShardError::Spawn { .. }));
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let invocation = Invocation {
            stage: Stage::Publish,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()],
            timeout: None,
        };
        let output = TokioProcessRunner.run(&invocation).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "broken");
        assert!(!output.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let invocation = Invocation {
            stage: Stage::Fetch,
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
            timeout: Some(Duration::from_millis(50)),
        };
        let err = TokioProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, ShardError::TimedOut { stage: Stage::Fetch, .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().ends_with("after 50ms"));
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let mut input = vec![b'a'; 20_000];
        input.extend_from_slice(b"last words");

        let tail = read_tail(input.as_slice(), 64).await;

        assert_eq!(tail.len(), 64);
        assert!(tail.ends_with(b"last words"));
        assert_eq!(read_tail(&b"short"[..], 64).await, b"short".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_stderr_is_bounded() {
        let invocation = Invocation {
            stage: Stage::Transform,
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "i=0; while [ $i -lt 20000 ]; do echo 'warning: skipped row' >&2; i=$((i+1)); done; echo done >&2; exit 4".to_string(),
            ],
            timeout: None,
        };
        let output = TokioProcessRunner.run(&invocation).await.unwrap();
        assert_eq!(output.code, Some(4));
        assert!(output.stderr.len() <= STDERR_TAIL_BYTES);
        assert!(output.stderr.ends_with("done"));
    }
}
