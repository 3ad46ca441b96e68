//! Pipe handles that are handed out before the process exists
//!
//! A worker gives the caller a `PipeEnd` before `start`; the underlying
//! process or channel handle is dropped into the shared slot once it is
//! created. Reads and writes issued earlier park until then.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

enum SlotState<T> {
    Pending(Option<Waker>),
    Open(T),
    Closed,
}

/// Shared slot holding one stream handle
pub(crate) struct PipeSlot<T> {
    state: Arc<Mutex<SlotState<T>>>,
}

impl<T> Clone for PipeSlot<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> PipeSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState::Pending(None))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the live handle and wake a parked caller
    pub(crate) fn open(&self, io: T) {
        let mut state = self.lock();
        if let SlotState::Pending(waker) = std::mem::replace(&mut *state, SlotState::Open(io)) {
            if let Some(waker) = waker {
                waker.wake();
            }
        } else {
            // Already closed by the caller; keep it closed
            *state = SlotState::Closed;
        }
    }

    /// Remove the live handle, leaving the slot closed
    pub(crate) fn take(&self) -> Option<T> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Closed) {
            SlotState::Open(io) => Some(io),
            SlotState::Pending(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                None
            }
            SlotState::Closed => None,
        }
    }

    pub(crate) fn close(&self) {
        drop(self.take());
    }

    pub(crate) fn end(&self) -> PipeEnd<T> {
        PipeEnd { slot: self.clone() }
    }
}

/// Caller-side handle of a [`PipeSlot`]
///
/// Reads return EOF and writes fail with `BrokenPipe` once the slot is
/// closed. Shutting down or dropping the end drops the handle, which is what
/// delivers EOF to the process on the other side.
pub(crate) struct PipeEnd<T> {
    slot: PipeSlot<T>,
}

impl<T> Drop for PipeEnd<T> {
    fn drop(&mut self) {
        self.slot.close();
    }
}

impl<T> AsyncRead for PipeEnd<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.slot.lock();
        match &mut *state {
            SlotState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            SlotState::Open(io) => Pin::new(io).poll_read(cx, buf),
            SlotState::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl<T> AsyncWrite for PipeEnd<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.slot.lock();
        match &mut *state {
            SlotState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            SlotState::Open(io) => Pin::new(io).poll_write(cx, buf),
            SlotState::Closed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe is closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.slot.lock();
        match &mut *state {
            SlotState::Open(io) => Pin::new(io).poll_flush(cx),
            SlotState::Pending(_) | SlotState::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.slot.lock();
        let result = match &mut *state {
            SlotState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            SlotState::Open(io) => ready!(Pin::new(io).poll_shutdown(cx)),
            SlotState::Closed => return Poll::Ready(Ok(())),
        };
        *state = SlotState::Closed;
        Poll::Ready(result)
    }
}
