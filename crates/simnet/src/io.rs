//! Remote process I/O.
//!
//! Backends reach their nodes through an [`Executor`]: a single blocking
//! "stream this command line until it is done" capability. [`RemoteIo`]
//! wraps every invocation that must not block the caller in its own
//! background task connected by in-memory pipes:
//!
//! - `read` pumps the command's stdout into a [`PipeReader`]; a failure is
//!   reported by the reader once the bytes produced before it are consumed.
//! - `write` pumps a [`PipeWriter`] into the command's stdin and reports
//!   termination once, through a [`Completion`].
//! - `exec` runs on the caller's task and drains both output streams
//!   before returning.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;

use crate::error::{Result, SimError};

/// Capacity of the in-memory pipes between callers and workers.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Stderr kept from an exec to decorate its error.
const KEPT_STDERR: usize = 16 * 1024;

pub type Input<'a> = &'a mut (dyn AsyncRead + Send + Unpin);
pub type Sink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// How a streamed command terminated, when it did not succeed.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The command could not be started or one of its streams broke.
    #[error("{0}")]
    Transport(#[from] io::Error),
    /// The command ran and exited with this status. Commands killed by a
    /// signal report -1.
    #[error("exit status {0}")]
    Exit(i32),
}

/// Decides who failed when a backend command line exits with a non-zero
/// status: the remote command (`Exit`) or the backend CLI itself
/// (`Transport`). Receives the exit status and the captured stderr.
pub type Classifier = fn(i32, &str) -> StreamError;

/// Every non-zero status belongs to the command that was run.
pub fn exit_status(code: i32, _stderr: &str) -> StreamError {
    StreamError::Exit(code)
}

/// Failure of the backend CLI that exited with `code`.
pub fn backend_exit(code: i32) -> StreamError {
    StreamError::Transport(io::Error::other(format!("backend exited with status {code}")))
}

/// Streams attached to one command invocation. Absent streams are closed.
#[derive(Default)]
pub struct StreamOptions<'a> {
    pub stdin: Option<Input<'a>>,
    pub stdout: Option<Sink<'a>>,
    pub stderr: Option<Sink<'a>>,
}

/// Output sinks of a synchronous exec. Absent sinks discard the stream.
#[derive(Default)]
pub struct ExecOptions<'a> {
    pub stdout: Option<Sink<'a>>,
    pub stderr: Option<Sink<'a>>,
}

/// Runs a command line and streams its standard streams until it exits.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn stream(&self, command: &[String], streams: StreamOptions<'_>) -> Result<(), StreamError>;
}

// ── Local process executor ──────────────────────────────────────────

/// Executes command lines as local child processes.
///
/// Backends hand it `docker exec ...` or `kubectl exec ...` lines, so the
/// backend CLI carries the remote transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl Executor for ProcessExecutor {
    async fn stream(&self, command: &[String], streams: StreamOptions<'_>) -> Result<(), StreamError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let StreamOptions {
            stdin,
            stdout,
            stderr,
        } = streams;

        let mut child = Command::new(program)
            .args(args)
            .stdin(piped_if(stdin.is_some()))
            .stdout(piped_if(stdout.is_some()))
            .stderr(piped_if(stderr.is_some()))
            .kill_on_drop(true)
            .spawn()?;

        tracing::trace!(program = %program, pid = ?child.id(), "spawned command");

        let feed = feed_stdin(stdin, child.stdin.take());
        let out = drain(child.stdout.take(), stdout);
        let err = drain(child.stderr.take(), stderr);
        tokio::try_join!(feed, out, err)?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(StreamError::Exit(status.code().unwrap_or(-1)))
        }
    }
}

fn piped_if(attached: bool) -> Stdio {
    if attached {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

async fn feed_stdin(source: Option<Input<'_>>, stdin: Option<ChildStdin>) -> io::Result<()> {
    let (Some(source), Some(mut stdin)) = (source, stdin) else {
        return Ok(());
    };
    match tokio::io::copy(source, &mut stdin).await {
        // The command may exit without consuming all of its input.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e),
        Ok(_) => Ok(()),
    }
}

async fn drain<R>(source: Option<R>, sink: Option<Sink<'_>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let (Some(mut source), Some(sink)) = (source, sink) {
        tokio::io::copy(&mut source, &mut *sink).await?;
        sink.flush().await?;
    }
    Ok(())
}

// ── Retry policy ────────────────────────────────────────────────────

/// Bounded exponential backoff for idempotent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

// ── Pipes ───────────────────────────────────────────────────────────

type FailureSlot = Arc<Mutex<Option<io::Error>>>;

/// Read end of a remote stream.
///
/// Yields the bytes produced by the remote command, then either a clean
/// end of stream or, once, the error that terminated the command.
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    failure: FailureSlot,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let at_end = buf.remaining() > 0 && buf.filled().len() == before;
        if at_end {
            // The worker stores the failure before closing its end.
            let failure = self
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(err) = failure {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Write end feeding a remote command's standard input.
///
/// Shutting it down (or dropping it) signals end of input.
#[derive(Debug)]
pub struct PipeWriter {
    inner: DuplexStream,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Outcome of a streaming write, delivered exactly once.
///
/// Awaiting consumes the completion. Dropping it unawaited is allowed and
/// never blocks the worker.
#[derive(Debug)]
pub struct Completion {
    node: String,
    done: oneshot::Receiver<Result<()>>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.done).poll(cx));
        Poll::Ready(outcome.unwrap_or_else(|_| {
            Err(SimError::Transport {
                node: self.node.clone(),
                source: io::Error::other("write worker exited without reporting"),
            })
        }))
    }
}

/// Clonable in-memory sink collecting several streams into one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Counts the bytes forwarded to the wrapped sink.
struct Counting<'a, W: ?Sized> {
    inner: &'a mut W,
    written: u64,
}

impl<W: AsyncWrite + Unpin + ?Sized> AsyncWrite for Counting<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut *self.inner).poll_write(cx, buf))?;
        self.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Forwards to an optional sink and keeps the head of the stream.
struct Tee<'a> {
    sink: Option<Sink<'a>>,
    kept: Vec<u8>,
}

impl<'a> Tee<'a> {
    fn new(sink: Option<Sink<'a>>) -> Self {
        Self {
            sink,
            kept: Vec::new(),
        }
    }
}

impl AsyncWrite for Tee<'_> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let n = match this.sink.as_mut() {
            Some(sink) => ready!(Pin::new(&mut **sink).poll_write(cx, buf))?,
            None => buf.len(),
        };
        let room = KEPT_STDERR.saturating_sub(this.kept.len());
        this.kept.extend_from_slice(&buf[..n.min(room)]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.sink.as_mut() {
            Some(sink) => Pin::new(&mut **sink).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.sink.as_mut() {
            Some(sink) => Pin::new(&mut **sink).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ── Remote I/O ──────────────────────────────────────────────────────

/// Per-operation plumbing between callers and an [`Executor`].
///
/// Command lines are fully formed by the backend (`docker exec -i <c> ...`);
/// `node` arguments only label errors and logs.
#[derive(Clone)]
pub struct RemoteIo {
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
    classify: Classifier,
}

impl RemoteIo {
    pub fn new(executor: Arc<dyn Executor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            retry,
            classify: exit_status,
        }
    }

    /// Sets how non-zero exits of the backend CLI are attributed.
    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `command` to completion, streaming its output into the given
    /// sinks. Never retried. Failures carry the command's stderr, whether
    /// or not the caller asked for it.
    pub async fn exec(
        &self,
        node: &str,
        command: &[String],
        options: ExecOptions<'_>,
    ) -> Result<()> {
        tracing::debug!(node, command = %command.join(" "), "exec");
        let mut stdout = options.stdout;
        let mut stderr = Tee::new(options.stderr);
        let result = self
            .executor
            .stream(
                command,
                StreamOptions {
                    stdin: None,
                    stdout: reborrow(&mut stdout),
                    stderr: Some(&mut stderr),
                },
            )
            .await;
        result.map_err(|err| {
            let err = classify(self.classify, err, &stderr.kept);
            SimError::from_stream(node, err, trimmed(&stderr.kept))
        })
    }

    /// Starts `command` in the background and returns a reader over its
    /// standard output.
    ///
    /// Transport failures that happen before any byte was delivered are
    /// retried according to the retry policy.
    pub fn read(&self, node: &str, command: Vec<String>) -> PipeReader {
        let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
        let failure = FailureSlot::default();
        let slot = failure.clone();
        let executor = self.executor.clone();
        let retry = self.retry;
        let classifier = self.classify;
        let node = node.to_string();

        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                let mut stderr = Vec::new();
                let mut forwarded = Counting {
                    inner: &mut writer,
                    written: 0,
                };
                let result = executor
                    .stream(
                        &command,
                        StreamOptions {
                            stdin: None,
                            stdout: Some(&mut forwarded),
                            stderr: Some(&mut stderr),
                        },
                    )
                    .await;
                let delivered = forwarded.written;

                match result.map_err(|err| classify(classifier, err, &stderr)) {
                    Ok(()) => break,
                    Err(StreamError::Transport(err)) if delivered == 0 && attempt < retry.retries => {
                        let delay = retry.delay(attempt);
                        attempt += 1;
                        tracing::warn!(node = %node, attempt, error = %err, "read failed, retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        tracing::debug!(node = %node, error = %err, "read stream failed");
                        *slot.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(stream_failure(err, &stderr));
                        break;
                    }
                }
            }
            drop(writer);
        });

        PipeReader {
            inner: reader,
            failure,
        }
    }

    /// Starts `command` in the background, fed by the returned writer.
    ///
    /// The command's stdout and stderr are captured together and attached
    /// to the completion error. Never retried.
    pub fn write(&self, node: &str, command: Vec<String>) -> (PipeWriter, Completion) {
        let (input, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let executor = self.executor.clone();
        let classifier = self.classify;
        let worker_node = node.to_string();

        tokio::spawn(async move {
            let mut input = input;
            let output = SharedBuffer::default();
            let (mut out, mut err) = (output.clone(), output.clone());
            let result = executor
                .stream(
                    &command,
                    StreamOptions {
                        stdin: Some(&mut input),
                        stdout: Some(&mut out),
                        stderr: Some(&mut err),
                    },
                )
                .await
                .map_err(|e| {
                    let text = output.text();
                    let e = classify(classifier, e, text.as_bytes());
                    SimError::from_stream(&worker_node, e, text)
                });

            if let Err(e) = &result {
                tracing::debug!(node = %worker_node, error = %e, "write stream failed");
            }
            // The receiver may be gone; the outcome is then discarded.
            let _ = done_tx.send(result);
        });

        (
            PipeWriter { inner: writer },
            Completion {
                node: node.to_string(),
                done: done_rx,
            },
        )
    }

    /// Runs an idempotent control-plane command and returns its stdout.
    /// Transport failures are retried.
    pub async fn query(&self, command: &[String]) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.capture(command, None).await {
                Err((StreamError::Transport(err), _)) if attempt < self.retry.retries => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    tracing::warn!(command = %command.join(" "), attempt, error = %err, "query failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                result => return result.map_err(|(err, stderr)| backend_error(command, err, &stderr)),
            }
        }
    }

    /// Runs a mutating control-plane command once, optionally feeding
    /// `input` on its stdin, and returns its stdout.
    pub async fn invoke(&self, command: &[String], input: Option<&[u8]>) -> Result<String> {
        self.capture(command, input)
            .await
            .map_err(|(err, stderr)| backend_error(command, err, &stderr))
    }

    async fn capture(
        &self,
        command: &[String],
        input: Option<&[u8]>,
    ) -> Result<String, (StreamError, Vec<u8>)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut input = input;
        let result = self
            .executor
            .stream(
                command,
                StreamOptions {
                    stdin: input.as_mut().map(|bytes| bytes as Input<'_>),
                    stdout: Some(&mut stdout),
                    stderr: Some(&mut stderr),
                },
            )
            .await;

        match result {
            Ok(()) => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Err(err) => Err((classify(self.classify, err, &stderr), stderr)),
        }
    }
}

fn classify(classifier: Classifier, err: StreamError, stderr: &[u8]) -> StreamError {
    match err {
        StreamError::Exit(code) => classifier(code, &String::from_utf8_lossy(stderr)),
        transport => transport,
    }
}

fn reborrow<'a>(sink: &'a mut Option<Sink<'_>>) -> Option<Sink<'a>> {
    match sink {
        Some(sink) => Some(&mut **sink),
        None => None,
    }
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// Error closing a read pipe: the command's stderr when it said anything,
/// the bare failure otherwise.
fn stream_failure(err: StreamError, stderr: &[u8]) -> io::Error {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    match err {
        _ if !text.is_empty() => io::Error::other(text.to_string()),
        StreamError::Transport(err) => err,
        StreamError::Exit(_) => io::Error::other(err.to_string()),
    }
}

fn backend_error(command: &[String], err: StreamError, stderr: &[u8]) -> SimError {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim_end();
    SimError::Backend {
        command: command.join(" "),
        detail: if stderr.is_empty() {
            err.to_string()
        } else {
            format!("{err}: {stderr}")
        },
    }
}
