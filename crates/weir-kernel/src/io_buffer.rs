//! Relay buffer between producers and consumers with mismatched timing.
//!
//! OS pipes hand out bytes whenever the child writes them; stage channels
//! want them at the pace of the downstream stage. `IoBuffer` sits between the
//! two: one side pulls from any `AsyncRead` into a bounded channel, the other
//! side pushes that channel into a destination channel.
//!
//! ```text
//!   source (ChildStdout, ChannelReader, ...) ──consume_from──▶ [bounded] ──drain_to──▶ ChannelWriter
//! ```
//!
//! Each side can be attached once. Closing travels with ownership: when
//! `consume_from` returns its writer is dropped, and `drain_to` closes the
//! destination exactly once when it finishes.

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::channel::{channel, ChannelReader, ChannelWriter};
use crate::error::{ShellError, ShellResult};

const READ_CHUNK: usize = 8 * 1024;

/// A bounded relay with one inbound and one outbound side.
pub struct IoBuffer {
    inbound: Mutex<Option<ChannelWriter>>,
    outbound: Mutex<Option<ChannelReader>>,
}

impl IoBuffer {
    /// Create a relay whose internal buffer holds `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let (writer, reader) = channel(capacity);
        Self {
            inbound: Mutex::new(Some(writer)),
            outbound: Mutex::new(Some(reader)),
        }
    }

    /// Copy `source` into the buffer until it ends, then close the buffer.
    ///
    /// Returns the number of bytes relayed.
    pub async fn consume_from<R>(&self, mut source: R) -> ShellResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let writer = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ShellError::InvalidStage("io buffer source already attached".into()))?;

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            writer.send(&chunk[..n]).await?;
            total += n as u64;
        }
        writer.close();
        Ok(total)
    }

    /// Copy buffered bytes to `destination` until the buffer is closed and
    /// empty, then close `destination`.
    ///
    /// Returns the number of bytes relayed.
    pub async fn drain_to(&self, destination: ChannelWriter) -> ShellResult<u64> {
        let mut reader = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                ShellError::InvalidStage("io buffer destination already attached".into())
            })?;

        let mut total = 0u64;
        while let Some(chunk) = reader.recv().await {
            destination.send(&chunk).await?;
            total += chunk.len() as u64;
        }
        destination.close();
        Ok(total)
    }

    /// Run both sides to completion: `source` → buffer → `destination`.
    pub async fn relay<R>(capacity: usize, source: R, destination: ChannelWriter) -> ShellResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let buffer = IoBuffer::new(capacity);
        let (consumed, drained) =
            tokio::join!(buffer.consume_from(source), buffer.drain_to(destination));
        consumed?;
        drained
    }
}
