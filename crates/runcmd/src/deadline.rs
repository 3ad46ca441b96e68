//! Deadline-bounded byte stream
//!
//! Wraps the raw TCP stream under an SSH transport. While armed, every read
//! or write that does not complete within the configured timeout fails with
//! `TimedOut`. The deadlines are armed only for connection setup and command
//! dispatch, so output of a long-running command is never cut off.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Sleep, sleep};

/// Per-direction timeouts; zero disables the deadline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadlines {
    /// Timeout for each read
    pub read: Duration,
    /// Timeout for each write
    pub write: Duration,
}

/// Shared, lock-guarded deadline state of one connection
#[derive(Debug, Clone, Default)]
pub struct DeadlineHandle {
    inner: Arc<Mutex<Deadlines>>,
}

impl DeadlineHandle {
    /// Create a handle with both deadlines disabled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current deadlines
    #[must_use]
    pub fn current(&self) -> Deadlines {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace both deadlines
    pub fn set(&self, read: Duration, write: Duration) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Deadlines { read, write };
    }

    /// Disable both deadlines
    pub fn clear(&self) {
        self.set(Duration::ZERO, Duration::ZERO);
    }

    /// Arm deadlines until the returned guard is dropped
    #[must_use = "deadlines are cleared as soon as the guard is dropped"]
    pub fn arm(&self, read: Duration, write: Duration) -> DeadlineGuard {
        self.set(read, write);
        DeadlineGuard {
            handle: self.clone(),
        }
    }
}

/// Clears the deadlines of a [`DeadlineHandle`] on drop
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: DeadlineHandle,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.clear();
    }
}

/// Stream decorator applying the deadlines of a [`DeadlineHandle`]
#[derive(Debug)]
pub struct DeadlineBoundedConnection<S> {
    inner: S,
    deadlines: DeadlineHandle,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineBoundedConnection<S> {
    /// Wrap `inner`, reading deadlines from `deadlines` on every operation
    pub fn new(inner: S, deadlines: DeadlineHandle) -> Self {
        Self {
            inner,
            deadlines,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Handle controlling this connection's deadlines
    pub fn deadlines(&self) -> &DeadlineHandle {
        &self.deadlines
    }

    /// Unwrap the raw stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Poll the pending operation's deadline, starting it on first use
fn expired(slot: &mut Option<Pin<Box<Sleep>>>, timeout: Duration, cx: &mut Context<'_>) -> bool {
    if timeout.is_zero() {
        *slot = None;
        return false;
    }

    let deadline = slot.get_or_insert_with(|| Box::pin(sleep(timeout)));
    if deadline.as_mut().poll(cx).is_ready() {
        *slot = None;
        return true;
    }
    false
}

fn timed_out(direction: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{direction} deadline exceeded"),
    )
}

impl<S> AsyncRead for DeadlineBoundedConnection<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.deadlines.current().read;
                if expired(&mut this.read_deadline, timeout, cx) {
                    Poll::Ready(Err(timed_out("read")))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S> AsyncWrite for DeadlineBoundedConnection<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.deadlines.current().write;
                if expired(&mut this.write_deadline, timeout, cx) {
                    Poll::Ready(Err(timed_out("write")))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_read_times_out_when_armed() {
        let (_peer, stream) = duplex(64);
        let handle = DeadlineHandle::new();
        let mut conn = DeadlineBoundedConnection::new(stream, handle.clone());

        let _armed = handle.arm(Duration::from_millis(50), Duration::ZERO);
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_expires() {
        let (_peer, stream) = duplex(64);
        let mut conn = DeadlineBoundedConnection::new(stream, DeadlineHandle::new());

        let mut buf = [0u8; 8];
        let pending = timeout(Duration::from_millis(150), conn.read(&mut buf)).await;

        assert!(pending.is_err(), "read without deadline must keep waiting");
    }

    #[tokio::test]
    async fn test_data_arriving_in_time_is_delivered() {
        let (mut peer, stream) = duplex(64);
        let handle = DeadlineHandle::new();
        let mut conn = DeadlineBoundedConnection::new(stream, handle.clone());
        let _armed = handle.arm(Duration::from_secs(5), Duration::from_secs(5));

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_write_times_out_when_peer_stalls() {
        let (_peer, stream) = duplex(4);
        let handle = DeadlineHandle::new();
        let mut conn = DeadlineBoundedConnection::new(stream, handle.clone());
        let _armed = handle.arm(Duration::ZERO, Duration::from_millis(50));

        let err = conn.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_handle_is_shared_with_connection() {
        let (mut peer, stream) = duplex(64);
        let handle = DeadlineHandle::new();
        let conn = DeadlineBoundedConnection::new(stream, handle.clone());

        conn.deadlines().set(Duration::from_secs(3), Duration::ZERO);
        assert_eq!(handle.current().read, Duration::from_secs(3));

        let mut raw = conn.into_inner();
        raw.write_all(b"raw").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw");
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let handle = DeadlineHandle::new();
        {
            let _armed = handle.arm(Duration::from_secs(1), Duration::from_secs(2));
            assert_eq!(
                handle.current(),
                Deadlines {
                    read: Duration::from_secs(1),
                    write: Duration::from_secs(2),
                }
            );
        }
        assert_eq!(handle.current(), Deadlines::default());
    }
}
