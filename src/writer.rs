//! Dedicated writer loop for one session.
//!
//! Every outgoing envelope is encoded by the caller and handed to the writer
//! through a bounded channel. The writer is the only thing touching the
//! socket's write half, so messages go out strictly in enqueue order and
//! there is exactly one write in flight per session.
//!
//! # Architecture
//!
//! ```text
//! Dispatch job 1 ─┐
//! Dispatch job 2 ─┼─► flume::Sender<Bytes> (bounded) ─► writer_loop ─► TcpStream
//! Client call N  ─┘
//! ```
//!
//! Ready messages are batched into a single `write_vectored` call. When the
//! queue is full, senders wait up to the backpressure timeout and then fail
//! with [`RpcError::BackpressureTimeout`].

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for a session's write queue.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Messages that may wait for the socket before senders block.
    pub channel_capacity: usize,
    /// How long a sender waits for room in a full queue.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing writes. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: flume::Sender<Bytes>,
    closing: CancellationToken,
    timeout: Duration,
}

/// Receiving end consumed by [`writer_loop`].
pub struct WriterQueue {
    rx: flume::Receiver<Bytes>,
    closing: CancellationToken,
}

/// Create a connected handle/queue pair.
pub fn channel(config: &WriterConfig) -> (WriterHandle, WriterQueue) {
    let (tx, rx) = flume::bounded(config.channel_capacity.max(1));
    let closing = CancellationToken::new();
    (
        WriterHandle {
            tx,
            closing: closing.clone(),
            timeout: config.backpressure_timeout,
        },
        WriterQueue { rx, closing },
    )
}

impl WriterHandle {
    /// Queue an encoded message, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotConnected`] if close was requested or the writer has
    ///   exited
    /// - [`RpcError::BackpressureTimeout`] if the queue stayed full for the
    ///   whole backpressure timeout
    pub fn send(&self, message: Bytes) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(RpcError::NotConnected);
        }

        self.tx
            .send_timeout(message, self.timeout)
            .map_err(|e| match e {
                flume::SendTimeoutError::Timeout(_) => RpcError::BackpressureTimeout,
                flume::SendTimeoutError::Disconnected(_) => RpcError::NotConnected,
            })
    }

    /// Ask the writer to flush what is queued and shut the stream down.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Messages waiting for the socket.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Drain the queue into `writer` until close is requested or every handle
/// is dropped, then shut the write half down.
///
/// Everything queued before the close request is written first. Uses
/// batching and scatter/gather I/O (writev).
pub async fn writer_loop<W>(queue: WriterQueue, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let WriterQueue { rx, closing } = queue;
    let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let done = tokio::select! {
            biased;
            received = rx.recv_async() => match received {
                Ok(message) => {
                    batch.push(message);
                    false
                }
                Err(_) => true,
            },
            _ = closing.cancelled() => true,
        };

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        batch.clear();

        if done && rx.is_empty() {
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write a batch of messages using `write_vectored`, continuing after
/// partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for message in batch {
        let end = offset + message.len();
        if skip_bytes < end && !message.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&message[start..]));
        }
        offset = end;
    }

    slices
}
