//! Protocol module - wire format, framing, and the framed channel.
//!
//! - 4-byte big-endian length prefix per frame
//! - Frame buffer for accumulating partial reads
//! - [`FramedChannel`] for typed send/receive over a byte stream

mod channel;
mod frame_buffer;
mod wire_format;

pub use channel::{FrameReader, FrameWriter, FramedChannel, OutboundFrame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    build_frame, Header, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
