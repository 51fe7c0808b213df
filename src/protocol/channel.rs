//! Typed, length-prefixed message channel over any duplex byte stream.
//!
//! [`FramedChannel`] pairs a [`FrameReader`] and a [`FrameWriter`]. The
//! halves can be split so one task receives while another sends; a single
//! half is never shared between tasks, so exactly one frame is in flight per
//! direction.
//!
//! # Example
//!
//! ```
//! # tokio_test_block_on(async {
//! use std::sync::Arc;
//! use pipeplex::codec::TextCodec;
//! use pipeplex::protocol::FramedChannel;
//!
//! let (a, b) = tokio::io::duplex(1024);
//! let mut tx = FramedChannel::new(a, Arc::new(TextCodec));
//! let mut rx = FramedChannel::new(b, Arc::new(TextCodec));
//!
//! tx.send(&"hello".to_string()).await.unwrap();
//! tx.drain().await.unwrap();
//! assert_eq!(rx.receive().await.unwrap().as_deref(), Some("hello"));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::frame_buffer::FrameBuffer;
use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::codec::Codec;
use crate::error::{PipeplexError, Result};

/// Read buffer size for a single pipe read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A frame ready to be written: encoded header plus payload.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (4 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Frame a payload, enforcing `max_frame_size`.
    pub fn new(payload: Bytes, max_frame_size: u32) -> Result<Self> {
        let header = Header::for_payload(payload.len(), max_frame_size)?;
        Ok(Self {
            header: header.encode(),
            payload,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Receiving half of a framed channel.
pub struct FrameReader<R, C> {
    reader: R,
    codec: Arc<C>,
    buffer: FrameBuffer,
    ready: VecDeque<Bytes>,
    read_buf: Vec<u8>,
    failed: Option<PipeplexError>,
    eof: bool,
}

impl<R, C> FrameReader<R, C>
where
    R: AsyncRead + Unpin,
    C: Codec,
{
    /// Create a reader with the given frame size limit.
    pub fn new(reader: R, codec: Arc<C>, max_frame_size: u32) -> Self {
        Self {
            reader,
            codec,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            ready: VecDeque::new(),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            failed: None,
            eof: false,
        }
    }

    /// Wait for the next complete payload without decoding it.
    ///
    /// Returns `Ok(None)` when the peer closed the stream at a frame boundary.
    /// This method is cancel-safe: dropping the future never loses bytes.
    pub async fn receive_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(payload));
            }
            if let Some(e) = self.failed.take() {
                return Err(e);
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                self.eof = true;
                if !self.buffer.is_empty() {
                    return Err(PipeplexError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed in the middle of a frame",
                    )));
                }
                return Ok(None);
            }

            if let Err(e) = self.buffer.push_into(&self.read_buf[..n], &mut self.ready) {
                self.failed = Some(e);
            }
        }
    }

    /// Wait for the next message and decode it.
    ///
    /// A decode failure consumes the offending frame, so the next call
    /// continues with the following one.
    pub async fn receive(&mut self) -> Result<Option<C::Item>> {
        match self.receive_frame().await? {
            Some(payload) => self.codec.decode(payload).map(Some),
            None => Ok(None),
        }
    }
}

/// Sending half of a framed channel.
pub struct FrameWriter<W, C> {
    writer: W,
    codec: Arc<C>,
    max_frame_size: u32,
}

impl<W, C> FrameWriter<W, C>
where
    W: AsyncWrite + Unpin,
    C: Codec,
{
    /// Create a writer with the given frame size limit.
    pub fn new(writer: W, codec: Arc<C>, max_frame_size: u32) -> Self {
        Self {
            writer,
            codec,
            max_frame_size,
        }
    }

    /// Encode a message into a frame without writing it.
    pub fn encode(&self, item: &C::Item) -> Result<OutboundFrame> {
        let payload = self.codec.encode(item)?;
        OutboundFrame::new(payload, self.max_frame_size)
    }

    /// Serialize and write one message.
    pub async fn send(&mut self, item: &C::Item) -> Result<()> {
        let frame = self.encode(item)?;
        self.write_frames(std::slice::from_ref(&frame)).await
    }

    /// Write already-encoded frames with scatter/gather I/O.
    pub async fn write_frames(&mut self, batch: &[OutboundFrame]) -> Result<()> {
        write_batch(&mut self.writer, batch).await
    }

    /// Wait until everything written so far is flushed to the transport.
    pub async fn drain(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write direction.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A duplex stream carrying framed messages of one codec.
pub struct FramedChannel<S, C> {
    reader: FrameReader<ReadHalf<S>, C>,
    writer: FrameWriter<WriteHalf<S>, C>,
}

impl<S, C> FramedChannel<S, C>
where
    S: AsyncRead + AsyncWrite,
    C: Codec,
{
    /// Wrap a stream with the default frame size limit.
    pub fn new(stream: S, codec: Arc<C>) -> Self {
        Self::with_max_frame_size(stream, codec, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Wrap a stream with a custom frame size limit.
    pub fn with_max_frame_size(stream: S, codec: Arc<C>, max_frame_size: u32) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, codec.clone(), max_frame_size),
            writer: FrameWriter::new(write_half, codec, max_frame_size),
        }
    }

    /// Serialize and write one message.
    pub async fn send(&mut self, item: &C::Item) -> Result<()> {
        self.writer.send(item).await
    }

    /// Wait until previously sent frames are flushed.
    pub async fn drain(&mut self) -> Result<()> {
        self.writer.drain().await
    }

    /// Wait for the next message; `Ok(None)` on clean end-of-stream.
    pub async fn receive(&mut self) -> Result<Option<C::Item>> {
        self.reader.receive().await
    }

    /// Flush and shut down the write direction; the read side is dropped.
    pub async fn close(mut self) -> Result<()> {
        self.writer.close().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>, C>, FrameWriter<WriteHalf<S>, C>) {
        (self.reader, self.writer)
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored), then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(PipeplexError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RawCodec, TextCodec};
    use std::io::Cursor;
    use tokio::io::duplex;

    fn frame(payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(payload), u32::MAX).unwrap()
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![frame(b"hello")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame(b"hello")];
        let slices = build_remaining_slices(&batch, 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 1);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_into_second_frame() {
        let batch = vec![frame(b"abc"), frame(b"de")];
        let slices = build_remaining_slices(&batch, HEADER_SIZE + 3 + 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 2);
        assert_eq!(&*slices[1], b"de");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_send_receive_round_trip() {
        let (a, b) = duplex(4096);
        let mut tx = FramedChannel::new(a, Arc::new(TextCodec));
        let mut rx = FramedChannel::new(b, Arc::new(TextCodec));

        for msg in ["one", "", "three"] {
            tx.send(&msg.to_string()).await.unwrap();
        }
        tx.drain().await.unwrap();

        assert_eq!(rx.receive().await.unwrap().as_deref(), Some("one"));
        assert_eq!(rx.receive().await.unwrap().as_deref(), Some(""));
        assert_eq!(rx.receive().await.unwrap().as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (a, b) = duplex(4096);
        let tx = FramedChannel::new(a, Arc::new(RawCodec));
        let mut rx = FramedChannel::new(b, Arc::new(RawCodec));

        tx.close().await.unwrap();

        assert!(rx.receive().await.unwrap().is_none());
        // Stays at end-of-stream.
        assert!(rx.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_transport_error() {
        let (mut a, b) = duplex(4096);
        let mut rx = FramedChannel::new(b, Arc::new(RawCodec));

        a.write_all(&[0, 0, 0, 10, b'x']).await.unwrap();
        drop(a);

        let err = rx.receive().await.unwrap_err();
        assert!(matches!(err, PipeplexError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (mut a, b) = duplex(4096);
        let mut rx = FramedChannel::with_max_frame_size(b, Arc::new(RawCodec), 8);

        a.write_all(&Header::new(9).encode()).await.unwrap();

        assert!(matches!(
            rx.receive().await,
            Err(PipeplexError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_frame_delivered_before_oversized_header() {
        let (mut a, b) = duplex(4096);
        let mut rx = FramedChannel::with_max_frame_size(b, Arc::new(TextCodec), 8);

        a.write_all(&[0, 0, 0, 2, b'o', b'k', 0, 0, 1, 0])
            .await
            .unwrap();

        assert_eq!(rx.receive().await.unwrap().as_deref(), Some("ok"));
        assert!(matches!(
            rx.receive().await,
            Err(PipeplexError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (a, _b) = duplex(4096);
        let mut tx = FramedChannel::with_max_frame_size(a, Arc::new(RawCodec), 4);

        let result = tx.send(&Bytes::from_static(b"too long")).await;
        assert!(matches!(result, Err(PipeplexError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_decode_error_skips_only_bad_frame() {
        let (a, b) = duplex(4096);
        let mut raw_tx = FramedChannel::new(a, Arc::new(RawCodec));
        let mut rx = FramedChannel::new(b, Arc::new(TextCodec));

        raw_tx.send(&Bytes::from_static(&[0xff, 0xfe])).await.unwrap();
        raw_tx.send(&Bytes::from_static(b"ok")).await.unwrap();

        assert!(rx.receive().await.unwrap_err().is_serialization());
        assert_eq!(rx.receive().await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let (a, b) = duplex(64);
        let (mut reader, _w) = FramedChannel::new(a, Arc::new(TextCodec)).into_split();
        let (_r, mut writer) = FramedChannel::new(b, Arc::new(TextCodec)).into_split();

        let sender = tokio::spawn(async move {
            for i in 0..50 {
                writer.send(&format!("msg-{}", i)).await.unwrap();
            }
        });

        for i in 0..50 {
            let got = reader.receive().await.unwrap().unwrap();
            assert_eq!(got, format!("msg-{}", i));
        }
        sender.await.unwrap();
    }
}
