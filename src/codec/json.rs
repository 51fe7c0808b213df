//! JSON codec using `serde_json`.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// JSON codec for structured data. One JSON document per frame.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create a codec for `T`.
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = T;

    fn encode(&self, item: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(item)?))
    }

    fn decode(&self, payload: Bytes) -> Result<T> {
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Command {
        Join { room: String },
        Leave,
    }

    #[test]
    fn test_round_trip_enum() {
        let codec = JsonCodec::<Command>::new();
        for cmd in [
            Command::Join {
                room: "lobby".into(),
            },
            Command::Leave,
        ] {
            let encoded = codec.encode(&cmd).unwrap();
            assert_eq!(codec.decode(encoded).unwrap(), cmd);
        }
    }

    #[test]
    fn test_wire_shape() {
        let codec = JsonCodec::<Command>::new();
        let encoded = codec.encode(&Command::Leave).unwrap();
        assert_eq!(&encoded[..], br#"{"type":"leave"}"#);
    }

    #[test]
    fn test_invalid_json() {
        let codec = JsonCodec::<Command>::new();
        let err = codec.decode(Bytes::from_static(b"{oops")).unwrap_err();
        assert!(err.is_serialization());
    }
}
