//! Codec module - serialization/deserialization for frame payloads.
//!
//! Every channel is parameterized by a [`Codec`], which turns one message
//! into one frame payload and back:
//!
//! - [`RawCodec`] - Pass-through for raw bytes (zero-copy)
//! - [`TextCodec`] - UTF-8 strings
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! Custom codecs implement the trait and plug into
//! [`ServerBuilder`](crate::ServerBuilder) / [`ClientBuilder`](crate::ClientBuilder).
//!
//! # Example
//!
//! ```
//! use pipeplex::codec::{Codec, MsgPackCodec, TextCodec};
//!
//! let text = TextCodec;
//! let encoded = text.encode(&"hello".to_string()).unwrap();
//! assert_eq!(text.decode(encoded).unwrap(), "hello");
//!
//! let msgpack = MsgPackCodec::<Vec<u32>>::new();
//! let encoded = msgpack.encode(&vec![1, 2, 3]).unwrap();
//! assert_eq!(msgpack.decode(encoded).unwrap(), vec![1, 2, 3]);
//! ```

mod json;
mod msgpack;
mod raw;
mod text;

use bytes::Bytes;

use crate::error::Result;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;
pub use text::TextCodec;

/// Converts messages to frame payloads and back.
///
/// Implementations must be stateless with respect to the stream: each call
/// sees exactly one whole payload.
pub trait Codec: Send + Sync + 'static {
    /// The message type carried by frames.
    type Item: Send + Sync + 'static;

    /// Serialize one message.
    fn encode(&self, item: &Self::Item) -> Result<Bytes>;

    /// Deserialize one payload.
    fn decode(&self, payload: Bytes) -> Result<Self::Item>;
}
