//! Shared helpers for tests of the harness and of user rounds.
//!
//! [`ScriptedExecutor`] stands in for the `docker` / `kubectl` command line:
//! every invocation is recorded and answered by a handler closure, so
//! strategies and remote I/O can be exercised without a container engine.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::io::{Executor, StreamError, StreamOptions};

/// How a scripted command terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Exit(i32),
    /// The transport broke with this message.
    Transport(String),
}

/// Scripted answer to one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: Outcome,
}

impl Reply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            outcome: Outcome::Success,
        }
    }

    pub fn exit(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            outcome: Outcome::Exit(code),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            outcome: Outcome::Transport(message.into()),
        }
    }
}

type Handler = dyn Fn(&[String], &[u8]) -> Reply + Send + Sync;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub command: Vec<String>,
    pub stdin: Vec<u8>,
}

/// Executor answering every command through a handler closure.
///
/// The handler receives the command line and the whole stdin content, which
/// is drained before the handler runs.
pub struct ScriptedExecutor {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new(handler: impl Fn(&[String], &[u8]) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Executor that succeeds on every command with no output.
    pub fn succeeding() -> Self {
        Self::new(|_, _| Reply::ok(""))
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Command lines received so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().iter().map(|c| c.command.clone()).collect()
    }

    pub fn recorded(&self) -> Vec<Call> {
        self.lock().clone()
    }

    /// Stdin received by the `index`-th invocation.
    pub fn stdin_of(&self, index: usize) -> Vec<u8> {
        self.lock()
            .get(index)
            .map(|c| c.stdin.clone())
            .unwrap_or_default()
    }

    /// Invocations whose command line contains every word of `words`, in order.
    pub fn matching(&self, words: &[&str]) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|command| contains_sequence(command, words))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("calls", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn stream(&self, command: &[String], streams: StreamOptions<'_>) -> Result<(), StreamError> {
        let mut stdin = Vec::new();
        if let Some(input) = streams.stdin {
            input.read_to_end(&mut stdin).await?;
        }

        let reply = (self.handler)(command, &stdin);
        self.lock().push(Call {
            command: command.to_vec(),
            stdin,
        });

        if let Some(out) = streams.stdout {
            out.write_all(&reply.stdout).await?;
            out.flush().await?;
        }
        if let Some(err) = streams.stderr {
            err.write_all(&reply.stderr).await?;
            err.flush().await?;
        }

        match reply.outcome {
            Outcome::Success => Ok(()),
            Outcome::Exit(code) => Err(StreamError::Exit(code)),
            Outcome::Transport(message) => Err(StreamError::Transport(io::Error::new(
                io::ErrorKind::ConnectionReset,
                message,
            ))),
        }
    }
}

fn contains_sequence(command: &[String], words: &[&str]) -> bool {
    let mut rest = command.iter();
    words.iter().all(|word| rest.any(|part| part == word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_command_and_stdin() {
        let executor = ScriptedExecutor::new(|command, stdin| {
            Reply::ok(format!("{} {}", command.len(), stdin.len()))
        });

        let mut input: &[u8] = b"abc";
        let mut out = Vec::new();
        executor
            .stream(
                &["kubectl".to_string(), "apply".to_string()],
                StreamOptions {
                    stdin: Some(&mut input),
                    stdout: Some(&mut out),
                    stderr: None,
                },
            )
            .await
            .expect("stream");

        assert_eq!(out, b"2 3");
        assert_eq!(executor.stdin_of(0), b"abc");
        assert_eq!(executor.matching(&["kubectl", "apply"]).len(), 1);
        assert!(executor.matching(&["apply", "kubectl"]).is_empty());
    }

    #[tokio::test]
    async fn scripted_failures() {
        let executor = ScriptedExecutor::new(|command, _| match command[0].as_str() {
            "exit" => Reply::exit(4, ""),
            _ => Reply::transport("gone"),
        });

        let exit = executor
            .stream(&["exit".to_string()], StreamOptions::default())
            .await;
        assert!(matches!(exit, Err(StreamError::Exit(4))));

        let broken = executor
            .stream(&["other".to_string()], StreamOptions::default())
            .await;
        assert!(matches!(broken, Err(StreamError::Transport(_))));
    }
}
