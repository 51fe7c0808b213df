//! Dedicated writer task for one connection.
//!
//! Interleaving writes from several callers would corrupt frame boundaries,
//! so every connection owns exactly one sender: callers push messages into
//! an mpsc queue and the writer loop serializes, frames and writes them.
//!
//! # Architecture
//!
//! ```text
//! push_message ─┐
//! broadcast    ─┼─► mpsc::UnboundedSender<T> ─► Writer Loop ─► Pipe
//! push_to(id)  ─┘
//! ```
//!
//! Ready messages are batched into a single vectored write.

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backpressure::BackpressureController;
use crate::codec::Codec;
use crate::error::{PipeplexError, Result};
use crate::protocol::FrameWriter;

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for queueing messages to the writer loop.
///
/// This is cheaply cloneable.
pub struct WriterHandle<T> {
    tx: mpsc::UnboundedSender<T>,
    backpressure: BackpressureController,
}

impl<T> Clone for WriterHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            backpressure: self.backpressure.clone(),
        }
    }
}

impl<T> WriterHandle<T> {
    /// Queue a message without waiting.
    ///
    /// Fails with `QueueFull` when a limit is configured and reached, or
    /// `ConnectionClosed` once the writer loop has exited.
    pub fn push(&self, item: T) -> Result<()> {
        self.backpressure.try_reserve()?;
        self.tx.send(item).map_err(|_| {
            self.backpressure.release();
            PipeplexError::ConnectionClosed
        })
    }

    /// Get current pending message count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Check if the queue limit is currently reached.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }
}

/// Receiving end of the outbound queue, consumed by [`writer_loop`].
pub struct WriterQueue<T> {
    rx: mpsc::UnboundedReceiver<T>,
    backpressure: BackpressureController,
}

impl<T> Drop for WriterQueue<T> {
    fn drop(&mut self) {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.backpressure.release_many(discarded);
    }
}

/// Create a connected handle/queue pair.
pub fn writer_channel<T>(max_pending: Option<usize>) -> (WriterHandle<T>, WriterQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backpressure = BackpressureController::new(max_pending);
    (
        WriterHandle {
            tx,
            backpressure: backpressure.clone(),
        },
        WriterQueue { rx, backpressure },
    )
}

/// Main writer loop - drains the queue and writes frames to the pipe.
///
/// A message that fails to serialize is reported through `on_error` and
/// skipped. A transport failure ends the loop with an error. On cancellation
/// or when every handle is dropped, the write direction is shut down and the
/// loop returns `Ok(())`. Messages still queued when the loop ends are
/// discarded and no longer count as pending.
pub async fn writer_loop<W, C, F>(
    mut queue: WriterQueue<C::Item>,
    mut writer: FrameWriter<W, C>,
    cancel: CancellationToken,
    on_error: F,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    C: Codec,
    F: Fn(PipeplexError),
{
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = queue.rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mut items = Vec::with_capacity(MAX_BATCH_SIZE);
        items.push(first);
        while items.len() < MAX_BATCH_SIZE {
            match queue.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }

        let mut frames = Vec::with_capacity(items.len());
        for item in &items {
            match writer.encode(item) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping message that failed to encode");
                    on_error(e);
                }
            }
        }

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                queue.backpressure.release_many(items.len());
                break;
            }
            r = writer.write_frames(&frames) => r,
        };
        queue.backpressure.release_many(items.len());
        written?;
    }

    queue.rx.close();
    let _ = writer.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RawCodec, TextCodec};
    use crate::protocol::{FrameReader, HEADER_SIZE};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_messages_written_in_order() {
        let (client, server) = duplex(64 * 1024);
        let (handle, queue) = writer_channel::<String>(None);
        let writer = FrameWriter::new(client, Arc::new(TextCodec), u32::MAX);
        let task = tokio::spawn(writer_loop(queue, writer, CancellationToken::new(), |_| {}));

        for i in 0..100 {
            handle.push(format!("m{}", i)).unwrap();
        }

        let mut reader = FrameReader::new(server, Arc::new(TextCodec), u32::MAX);
        for i in 0..100 {
            assert_eq!(reader.receive().await.unwrap().unwrap(), format!("m{}", i));
        }

        drop(handle);
        assert!(task.await.unwrap().is_ok());
        // Writer shut down the stream after the last handle dropped.
        assert!(reader.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_count_released_after_write() {
        let (client, mut server) = duplex(4096);
        let (handle, queue) = writer_channel::<Bytes>(None);
        let writer = FrameWriter::new(client, Arc::new(RawCodec), u32::MAX);
        let _task = tokio::spawn(writer_loop(queue, writer, CancellationToken::new(), |_| {}));

        handle.push(Bytes::from_static(b"hello")).unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[HEADER_SIZE..], b"hello");

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_limit_drops_newest() {
        let (handle, _queue) = writer_channel::<u32>(Some(2));

        handle.push(1).unwrap();
        handle.push(2).unwrap();
        assert!(handle.is_backpressure_active());
        assert!(matches!(handle.push(3), Err(PipeplexError::QueueFull)));
        assert_eq!(handle.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_push_after_loop_exit_is_closed() {
        let (client, _server) = duplex(4096);
        let (handle, queue) = writer_channel::<Bytes>(None);
        let writer = FrameWriter::new(client, Arc::new(RawCodec), u32::MAX);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer_loop(queue, writer, cancel.clone(), |_| {}));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let result = handle.push(Bytes::from_static(b"late"));
        assert!(matches!(result, Err(PipeplexError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_queued_messages() {
        let (client, _server) = duplex(4096);
        let (handle, queue) = writer_channel::<Bytes>(Some(4));
        let writer = FrameWriter::new(client, Arc::new(RawCodec), u32::MAX);
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            handle.push(Bytes::from_static(b"queued")).unwrap();
        }
        assert!(handle.is_backpressure_active());

        cancel.cancel();
        assert!(writer_loop(queue, writer, cancel, |_| {}).await.is_ok());

        assert_eq!(handle.pending_count(), 0);
        assert!(!handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_dropped_queue_releases_pending() {
        let (handle, queue) = writer_channel::<u32>(None);
        handle.push(1).unwrap();
        handle.push(2).unwrap();

        drop(queue);

        assert_eq!(handle.pending_count(), 0);
        assert!(matches!(handle.push(3), Err(PipeplexError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_message_reported_and_skipped() {
        let (client, server) = duplex(4096);
        let (handle, queue) = writer_channel::<Bytes>(None);
        let writer = FrameWriter::new(client, Arc::new(RawCodec), 4);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _task = tokio::spawn(writer_loop(
            queue,
            writer,
            CancellationToken::new(),
            move |e| sink.lock().unwrap().push(e.to_string()),
        ));

        handle.push(Bytes::from_static(b"way too long")).unwrap();
        handle.push(Bytes::from_static(b"ok")).unwrap();

        let mut reader = FrameReader::new(server, Arc::new(RawCodec), u32::MAX);
        assert_eq!(&reader.receive().await.unwrap().unwrap()[..], b"ok");
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
