//! Bounded byte channel connecting pipeline stages.
//!
//! Every edge in a pipeline is one of these: a fixed-capacity byte ring with
//! one writer and one reader.
//!
//! ```text
//!   ChannelWriter ──▶ [VecDeque<u8>, capacity N] ──▶ ChannelReader
//!                     ├── send suspends while full (backpressure)
//!                     ├── recv suspends while empty and open
//!                     ├── writer close/drop → reader sees end-of-stream
//!                     └── reader close/drop → writer gets BrokenPipe
//! ```
//!
//! The ring lives under a `std::sync::Mutex`; critical sections are only
//! deque operations and waker registration, so nothing ever awaits while
//! holding it. Close flags are atomics so `Drop` never needs the runtime.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default capacity, in bytes, of an inter-stage channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 512;

struct Ring {
    buffer: VecDeque<u8>,
    capacity: usize,
    reader_waker: Option<Waker>,
    writer_waker: Option<Waker>,
}

struct Shared {
    ring: Mutex<Ring>,
    writer_closed: AtomicBool,
    reader_closed: AtomicBool,
    /// Writes succeed and vanish. Used for outputs nobody is bound to.
    discard: bool,
}

impl Shared {
    fn new(capacity: usize, discard: bool) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Shared {
            ring: Mutex::new(Ring {
                buffer: VecDeque::with_capacity(capacity.min(8192)),
                capacity,
                reader_waker: None,
                writer_waker: None,
            }),
            writer_closed: AtomicBool::new(false),
            reader_closed: AtomicBool::new(false),
            discard,
        })
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_writer(&self) {
        if self.writer_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(waker) = self.ring().reader_waker.take() {
            waker.wake();
        }
    }

    fn close_reader(&self) {
        if self.reader_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ring = self.ring();
        ring.buffer.clear();
        if let Some(waker) = ring.writer_waker.take() {
            waker.wake();
        }
    }
}

/// Sending half of a channel.
pub struct ChannelWriter {
    shared: Arc<Shared>,
}

/// Receiving half of a channel.
pub struct ChannelReader {
    shared: Arc<Shared>,
}

/// Create a bounded channel holding at most `capacity` bytes (minimum 1).
pub fn channel(capacity: usize) -> (ChannelWriter, ChannelReader) {
    let shared = Shared::new(capacity, false);
    (
        ChannelWriter {
            shared: shared.clone(),
        },
        ChannelReader { shared },
    )
}

/// A writer that accepts and drops everything.
pub fn null_writer() -> ChannelWriter {
    ChannelWriter {
        shared: Shared::new(1, true),
    }
}

/// A reader that is already at end-of-stream.
pub fn closed_reader() -> ChannelReader {
    let shared = Shared::new(1, false);
    shared.writer_closed.store(true, Ordering::Release);
    ChannelReader { shared }
}

fn broken_pipe(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg)
}

impl ChannelWriter {
    /// Send all of `data`, suspending while the channel is full.
    ///
    /// Fails with `BrokenPipe` if the reader is gone or this writer was closed.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            pos += poll_fn(|cx| self.poll_send(cx, &data[pos..])).await?;
        }
        Ok(())
    }

    /// Close the channel. The reader drains what is buffered and then sees
    /// end-of-stream. Idempotent.
    pub fn close(&self) {
        self.shared.close_writer();
    }

    /// Whether the reading side has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.reader_closed.load(Ordering::Acquire)
    }

    /// Resolve once the reading side has gone away.
    ///
    /// Shares the writer's wake slot with `send`, so do not await both from
    /// different tasks at once.
    pub async fn closed(&self) {
        poll_fn(|cx| {
            let mut ring = self.shared.ring();
            if self.shared.reader_closed.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            ring.writer_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.ring().capacity
    }

    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.shared.writer_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(broken_pipe("channel writer closed")));
        }
        if self.shared.discard {
            return Poll::Ready(Ok(data.len()));
        }

        let mut ring = self.shared.ring();

        // Checked under the lock so a concurrent reader close cannot slip in
        // between the check and waker registration.
        if self.shared.reader_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(broken_pipe("channel reader closed")));
        }

        let room = ring.capacity.saturating_sub(ring.buffer.len());
        if room == 0 {
            ring.writer_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data.len().min(room);
        ring.buffer.extend(&data[..n]);
        if let Some(waker) = ring.reader_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }
}

impl ChannelReader {
    /// Receive everything currently buffered, suspending while the channel
    /// is empty and open. Returns `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        poll_fn(|cx| self.poll_recv(cx, usize::MAX)).await
    }

    /// Stop listening. Buffered bytes are dropped and the writer gets
    /// `BrokenPipe` on its next send. Idempotent.
    pub fn close(&self) {
        self.shared.close_reader();
    }

    fn poll_recv(&self, cx: &mut Context<'_>, max: usize) -> Poll<Option<Vec<u8>>> {
        let mut ring = self.shared.ring();

        if !ring.buffer.is_empty() {
            let n = ring.buffer.len().min(max);
            let chunk: Vec<u8> = ring.buffer.drain(..n).collect();
            if let Some(waker) = ring.writer_waker.take() {
                waker.wake();
            }
            return Poll::Ready(Some(chunk));
        }

        if self.shared.writer_closed.load(Ordering::Acquire)
            || self.shared.reader_closed.load(Ordering::Acquire)
        {
            return Poll::Ready(None);
        }

        ring.reader_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match self.poll_recv(cx, buf.remaining()) {
            Poll::Ready(Some(chunk)) => {
                buf.put_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.shared.close_writer();
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.shared.close_reader();
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("discard", &self.shared.discard)
            .field("closed", &self.shared.writer_closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("closed", &self.shared.reader_closed.load(Ordering::Relaxed))
            .finish()
    }
}
