//! Bounded byte pipe connecting the tee to a remote upload driver.
//!
//! A single producer (the tee task) writes chunks, a single consumer (the
//! HTTP request body or the part bufferer) reads them. The channel is
//! bounded so a slow remote applies backpressure to the inbound copy
//! instead of buffering the payload in memory.

use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Number of in-flight chunks. With 64 KiB chunks this keeps at most
/// 512 KiB buffered between producer and consumer.
const PIPE_DEPTH: usize = 8;

/// Chunk size the tee reads and forwards.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    (PipeWriter { tx }, PipeReader { rx })
}

/// Producer half of the pipe.
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Send one chunk downstream. Blocks while the pipe is full.
    ///
    /// Fails with `BrokenPipe` once the consumer is gone; callers that
    /// track a richer upload error substitute it for this one.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer is gone"))
    }

    /// Close the pipe, signalling clean end-of-stream to the consumer.
    pub fn close(self) {}

    /// Close the pipe with an error the consumer will observe instead of
    /// end-of-stream.
    pub async fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// Consumer half of the pipe. A `Stream` of chunks, convertible into an
/// `AsyncRead` for byte-oriented consumers.
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl PipeReader {
    /// Adapt the chunk stream to `AsyncRead`.
    pub fn into_async_read(self) -> StreamReader<PipeReader, Bytes> {
        StreamReader::new(self)
    }
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let (w, mut r) = pipe();

        tokio::spawn(async move {
            w.write(Bytes::from_static(b"hello ")).await.unwrap();
            w.write(Bytes::from_static(b"world")).await.unwrap();
        });

        assert_eq!(r.next().await.unwrap().unwrap(), "hello ");
        assert_eq!(r.next().await.unwrap().unwrap(), "world");
        assert!(r.next().await.is_none());
    }

    #[tokio::test]
    async fn write_fails_after_reader_dropped() {
        let (w, r) = pipe();
        drop(r);

        let err = w.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn close_with_error_reaches_reader() {
        let (w, mut r) = pipe();
        w.close_with_error(io::Error::new(io::ErrorKind::TimedOut, "deadline"))
            .await;

        let err = r.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn async_read_adapter_concatenates_chunks() {
        let (w, r) = pipe();
        tokio::spawn(async move {
            w.write(Bytes::from_static(b"ab")).await.unwrap();
            w.write(Bytes::from_static(b"cd")).await.unwrap();
        });

        let mut buf = Vec::new();
        r.into_async_read().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abcd");
    }
}
