//! Codec module - typed values to and from MessagePack.
//!
//! - [`MsgPackCodec`] - serde types <-> bytes, and serde types <-> [`rmpv::Value`]
//! - [`IntoParams`] - argument tuples -> positional call params
//!
//! Envelopes are modelled as dynamic [`rmpv::Value`]s; arguments and results
//! cross into typed Rust values through this codec.
//!
//! # Example
//!
//! ```
//! use packrpc::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let value = MsgPackCodec::to_value(&(1u8, "two")).unwrap();
//! let back: (u8, String) = MsgPackCodec::from_value(&value).unwrap();
//! assert_eq!(back, (1, "two".to_string()));
//! ```

mod msgpack;
mod params;

pub use msgpack::MsgPackCodec;
pub use params::IntoParams;
