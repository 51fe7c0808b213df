//! MsgPack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`, so structs travel as maps with field names
//! rather than positional arrays. Peers written against other MessagePack
//! implementations can then decode them without sharing field order.
//!
//! # Example
//!
//! ```
//! use pipeplex::codec::{Codec, MsgPackCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let codec = MsgPackCodec::<Message>::new();
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = codec.encode(&msg).unwrap();
//! assert_eq!(codec.decode(encoded).unwrap(), msg);
//! ```

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> MsgPackCodec<T> {
    /// Create a codec for `T`.
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for MsgPackCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MsgPackCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MsgPackCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MsgPackCodec")
    }
}

impl<T> Codec for MsgPackCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = T;

    #[inline]
    fn encode(&self, item: &T) -> Result<Bytes> {
        // to_vec_named, NOT to_vec
        Ok(Bytes::from(rmp_serde::to_vec_named(item)?))
    }

    #[inline]
    fn decode(&self, payload: Bytes) -> Result<T> {
        Ok(rmp_serde::from_slice(&payload)?)
    }
}
