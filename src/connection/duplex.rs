//! Duplex stream handed to the protocol client

use crate::transport::TransportStream;
use lsp_bridge_shared::Generation;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected socket, bound to the dial attempt that produced it
///
/// The protocol client reads server messages from and writes client messages
/// to the same handle. Dropping it closes the underlying connection.
pub struct DuplexHandle {
    inner: Box<dyn TransportStream>,
    generation: Generation,
    peer: String,
}

impl DuplexHandle {
    pub fn new<S: TransportStream>(stream: S, generation: Generation) -> Self {
        let peer = stream.peer();
        Self {
            inner: Box::new(stream),
            generation,
            peer,
        }
    }

    /// Dial attempt this stream came from
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl AsyncRead for DuplexHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexHandle {
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
