//! A stream facade whose backing transport can be replaced.
//!
//! Buffered readers and writers are built once over a [`RedirectableStream`].
//! When the connection is upgraded (plaintext to TLS) the transport underneath
//! is swapped, and everything layered on top keeps working.
//!
//! Swapping performs no compatibility checks: the caller must only swap once
//! the previous transport has been flushed and has no unread input buffered
//! above it.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Anything a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn Io>;

pub struct RedirectableStream {
    inner: BoxedIo,
}

impl RedirectableStream {
    pub fn new<S: Io + 'static>(stream: S) -> Self {
        Self {
            inner: Box::new(stream),
        }
    }

    /// Install `next` and hand back the previously active transport.
    pub fn swap(&mut self, next: BoxedIo) -> BoxedIo {
        std::mem::replace(&mut self.inner, next)
    }

    /// Take the active transport out, leaving a placeholder that fails every
    /// operation with [`io::ErrorKind::NotConnected`] until a new transport is
    /// swapped in.
    pub fn detach(&mut self) -> BoxedIo {
        self.swap(Box::new(Detached))
    }
}

impl From<BoxedIo> for RedirectableStream {
    fn from(inner: BoxedIo) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for RedirectableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectableStream").finish_non_exhaustive()
    }
}

impl AsyncRead for RedirectableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RedirectableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Placeholder installed while a transport is being upgraded.
struct Detached;

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is detached")
}

impl AsyncRead for Detached {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(not_connected()))
    }
}

impl AsyncWrite for Detached {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(not_connected()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(not_connected()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(not_connected()))
    }
}
