//! MsgPack codec using `rmp-serde` and `rmpv`.
//!
//! Typed values always go through `to_vec_named`, so structs travel as maps
//! (with field names) rather than positional arrays. Dynamic peers such as
//! the Go and C++ msgpack-rpc clients expect the map form.

use rmpv::Value;

use crate::error::{Result, RpcError};

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Convert a typed value into a dynamic [`Value`].
    pub fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value> {
        let bytes = Self::encode(value)?;
        rmpv::decode::read_value(&mut bytes.as_slice())
            .map_err(|e| RpcError::Protocol(format!("re-reading encoded value: {e}")))
    }

    /// Convert a dynamic [`Value`] into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::TypeMismatch`] if the value has the wrong shape.
    pub fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
        let bytes = Self::write_value(value)?;
        rmp_serde::from_slice(&bytes).map_err(|e| RpcError::TypeMismatch(e.to_string()))
    }

    /// Serialize a dynamic [`Value`] to bytes.
    pub fn write_value(value: &Value) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value)
            .map_err(|e| RpcError::Protocol(format!("writing value: {e}")))?;
        Ok(buf)
    }
}
