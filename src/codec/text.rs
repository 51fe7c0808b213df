//! UTF-8 text codec.
//!
//! Also used for the rendezvous handshake, whose single frame carries the
//! private pipe name.

use bytes::Bytes;

use super::Codec;
use crate::error::Result;

/// Codec for UTF-8 strings. Invalid UTF-8 on decode is a serialization error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    type Item = String;

    #[inline]
    fn encode(&self, item: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(item.as_bytes()))
    }

    fn decode(&self, payload: Bytes) -> Result<String> {
        Ok(String::from_utf8(payload.to_vec())?)
    }
}
