// ABOUTME: Stdio plumbing for commands: shared sinks, capture buffers, pipes.
// ABOUTME: Tracks which writers the library created so Wait can close exactly those.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Caller-facing reader type alias.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A writable sink that can be held by both the attachment copy task and the
/// close-after-wait ledger.
///
/// Cloning shares the underlying writer; `close` shuts it down. The library
/// only ever closes sinks it created (pipe writer ends); caller-supplied
/// writers are wrapped but never shut down.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl OutputSink {
    pub(crate) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink that discards everything, for commands with no stdout/stderr.
    pub(crate) fn discard() -> Self {
        Self::new(tokio::io::sink())
    }

    pub(crate) async fn close(&self) {
        let mut sink = self.clone();
        // Shutdown failures only mean the peer is already gone.
        let _ = sink.shutdown().await;
    }
}

impl AsyncWrite for OutputSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Pin::new(&mut **guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Pin::new(&mut **guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Pin::new(&mut **guard).poll_shutdown(cx)
    }
}

/// In-memory byte accumulator backing `output()` / `combined_output()`.
///
/// Clones share the same buffer, which is how `combined_output` feeds stdout
/// and stderr into one accumulator.
#[derive(Clone, Default)]
pub(crate) struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
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

/// Read end of a library-created pipe, handed to the caller by
/// `stdout_pipe` / `stderr_pipe`.
pub struct PipeReader {
    inner: DuplexStream,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Write end of a library-created pipe, handed to the caller by `stdin_pipe`.
///
/// The caller owns this end and must close it (shutdown or drop) to deliver
/// EOF to the container; `wait` will not close it.
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

/// Connected unidirectional pipe. Shutting down (or dropping) the write half
/// delivers EOF to the read half.
pub(crate) fn pipe() -> (PipeReader, PipeWriter) {
    let (write_half, read_half) = tokio::io::duplex(PIPE_CAPACITY);
    (
        PipeReader { inner: read_half },
        PipeWriter { inner: write_half },
    )
}

/// Ledger of sinks the library created for this command.
///
/// Draining on close makes the close idempotent across repeated `wait`
/// calls: each registered writer is shut down exactly once.
#[derive(Default)]
pub(crate) struct CloseAfterWait {
    sinks: Vec<OutputSink>,
}

impl CloseAfterWait {
    pub(crate) fn push(&mut self, sink: OutputSink) {
        self.sinks.push(sink);
    }

    pub(crate) async fn close_all(&mut self) {
        for sink in self.sinks.drain(..) {
            sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pipe_delivers_eof_after_sink_close() {
        let (mut reader, writer) = pipe();
        let sink = OutputSink::new(writer);

        let mut ledger = CloseAfterWait::default();
        ledger.push(sink.clone());

        let mut attached = sink.clone();
        attached.write_all(b"hello").await.unwrap();
        ledger.close_all().await;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn close_all_drains_the_ledger() {
        let (_reader, writer) = pipe();
        let sink = OutputSink::new(writer);
        let mut ledger = CloseAfterWait::default();
        ledger.push(sink);

        ledger.close_all().await;
        // Second close is a no-op rather than a double shutdown.
        ledger.close_all().await;
    }

    #[tokio::test]
    async fn capture_buffer_accumulates_shared_writes() {
        let buf = CaptureBuffer::new();
        let mut a = buf.clone();
        let mut b = buf.clone();
        a.write_all(b"out ").await.unwrap();
        b.write_all(b"err").await.unwrap();
        assert_eq!(buf.take(), b"out err");
        assert!(buf.take().is_empty());
    }
}
