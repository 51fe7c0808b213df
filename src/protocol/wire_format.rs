//! Wire format encoding and decoding.
//!
//! Every frame is a 4-byte length prefix followed by the payload:
//! ```text
//! ┌────────────────┬──────────────────────┐
//! │ Payload length │ Payload              │
//! │ 4 bytes        │ N bytes              │
//! │ uint32 BE      │ codec-defined        │
//! └────────────────┴──────────────────────┘
//! ```
//!
//! The handshake uses the same framing with a UTF-8 payload.

use crate::error::{PipeplexError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Absolute maximum payload size (~2 GB, max i32).
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = 2_147_483_647;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Build a header for a payload, rejecting payloads above `max_frame_size`.
    pub fn for_payload(len: usize, max_frame_size: u32) -> Result<Self> {
        let payload_length = u32::try_from(len).map_err(|_| {
            PipeplexError::Protocol(format!("Payload size {} does not fit a frame", len))
        })?;
        let header = Self::new(payload_length);
        header.validate(max_frame_size)?;
        Ok(header)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use pipeplex::protocol::Header;
    ///
    /// let bytes = Header::new(258).encode();
    /// assert_eq!(bytes, [0, 0, 1, 2]);
    /// ```
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.payload_length.to_be_bytes()
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    #[inline]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            payload_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }

    /// Validate the declared length against the configured maximum.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.payload_length > max_frame_size {
            return Err(PipeplexError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_frame_size
            )));
        }
        Ok(())
    }
}

/// Build a complete frame (header + payload) as a single buffer.
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::for_payload(payload.len(), ABSOLUTE_MAX_FRAME_SIZE)?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}
