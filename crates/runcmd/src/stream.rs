//! Stream plumbing shared by the executors

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::error::{RunError, StreamKind};
use crate::traits::{Sink, Source};

/// Most recent output kept for error reports
pub(crate) const CAPTURE_LIMIT: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// In-memory sink whose clones share one buffer
///
/// Useful as a sink for `set_stdout`/`set_stderr` when the caller wants
/// the bytes back after `wait`.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Take everything written so far, leaving the buffer empty
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of buffered bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Bounded tail of everything a worker delivered into its sinks
#[derive(Debug, Clone, Default)]
pub(crate) struct Capture {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    pub(crate) fn record(&self, bytes: &[u8]) {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.extend_from_slice(bytes);
        if buffer.len() > CAPTURE_LIMIT {
            let excess = buffer.len() - CAPTURE_LIMIT;
            buffer.drain(..excess);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Where a command's output goes
pub(crate) enum OutputBinding<P> {
    /// Discarded
    Unbound,
    /// Drained by the worker into a caller-supplied sink
    Sink(Sink),
    /// Handed to the caller as a pipe
    Pipe(P),
}

impl<P> Default for OutputBinding<P> {
    fn default() -> Self {
        OutputBinding::Unbound
    }
}

impl<P> OutputBinding<P> {
    pub(crate) fn is_bound(&self) -> bool {
        !matches!(self, OutputBinding::Unbound)
    }
}

/// Where a command's input comes from
pub(crate) enum InputBinding<P> {
    /// Empty input
    Unbound,
    /// Copied by the worker from a caller-supplied source
    Source(Source),
    /// Written by the caller through a pipe
    Pipe(P),
}

impl<P> Default for InputBinding<P> {
    fn default() -> Self {
        InputBinding::Unbound
    }
}

impl<P> InputBinding<P> {
    pub(crate) fn is_bound(&self) -> bool {
        !matches!(self, InputBinding::Unbound)
    }
}

/// Check that a pipe for `stream` may still be handed out
pub(crate) fn claim_pipe(stream: StreamKind, started: bool, bound: bool) -> Result<(), RunError> {
    if started {
        return Err(RunError::PipeError(format!(
            "{stream} pipe requested after start"
        )));
    }
    if bound {
        return Err(RunError::PipeError(format!("{stream} already set")));
    }
    Ok(())
}

/// Copy `reader` into `sink` until EOF, recording everything into `capture`
pub(crate) async fn drain<R>(mut reader: R, mut sink: Sink, capture: Capture) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        capture.record(&chunk[..n]);
        sink.write_all(&chunk[..n]).await?;
    }
    sink.flush().await
}

/// Write chunks from `chunks` into `sink` until the sender is dropped
///
/// The queue is bounded, so a slow sink holds back the sender.
pub(crate) async fn forward(
    mut chunks: Receiver<Vec<u8>>,
    mut sink: Sink,
    capture: Capture,
) -> io::Result<()> {
    while let Some(chunk) = chunks.recv().await {
        capture.record(&chunk);
        sink.write_all(&chunk).await?;
    }
    sink.flush().await
}

/// Await a drain task and classify its failure as a stream error
pub(crate) async fn join_stream(
    stream: StreamKind,
    task: JoinHandle<io::Result<()>>,
) -> Result<(), RunError> {
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(RunError::stream(stream, err)),
        Err(err) => Err(RunError::stream(stream, io::Error::other(err.to_string()))),
    }
}
