//! Raw codec - pass-through for binary data.
//!
//! Used when payload is already serialized or is raw bytes.
//! Both directions are zero-copy: `Bytes` is reference counted.
//!
//! # Example
//!
//! ```
//! use pipeplex::codec::{Codec, RawCodec};
//! use bytes::Bytes;
//!
//! let bytes = Bytes::from_static(b"zero copy");
//! let passed = RawCodec.encode(&bytes).unwrap();
//! assert_eq!(passed.as_ptr(), bytes.as_ptr()); // Same memory
//! ```

use bytes::Bytes;

use super::Codec;
use crate::error::Result;

/// Raw codec that passes bytes through without transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Item = Bytes;

    #[inline]
    fn encode(&self, item: &Bytes) -> Result<Bytes> {
        Ok(item.clone())
    }

    #[inline]
    fn decode(&self, payload: Bytes) -> Result<Bytes> {
        Ok(payload)
    }
}
