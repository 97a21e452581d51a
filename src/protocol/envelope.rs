//! Envelope encoding and decoding.
//!
//! Every message on the wire is one positional MessagePack array whose first
//! element is an integer tag:
//!
//! ```text
//! Call         = [0, id: u32, method: str, params: array]
//! Response     = [1, id: u32, error: any | nil, result: any | nil]
//! Notification = [2, method: str, params: array]
//! ```
//!
//! Envelopes are self-delimiting, so a TCP stream is just envelopes written
//! back to back. [`decode`] reports either a complete envelope together with
//! the number of bytes it occupied, or that more data is needed.
//!
//! # Example
//!
//! ```
//! use packrpc::protocol::{decode, Call, Decoded, Envelope};
//! use rmpv::Value;
//!
//! let call = Envelope::Call(Call::new(7, "echo", vec![Value::from("hi")]));
//! let bytes = call.encode().unwrap();
//!
//! match decode(&bytes).unwrap() {
//!     Decoded::Complete { envelope, consumed } => {
//!         assert_eq!(envelope, call);
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     Decoded::Incomplete => unreachable!(),
//! }
//! assert!(matches!(decode(&bytes[..3]).unwrap(), Decoded::Incomplete));
//! ```

use std::io::{Cursor, ErrorKind};

use rmpv::Value;

use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};

/// Envelope tag values.
pub mod tag {
    /// Call (request expecting a response).
    pub const CALL: u64 = 0;
    /// Response to a call.
    pub const RESPONSE: u64 = 1;
    /// Notification (request without a response).
    pub const NOTIFICATION: u64 = 2;
}

/// A request naming a method and expecting exactly one Response.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Message id, unique among the connection's outstanding calls.
    pub id: u32,
    /// Name of the bound function.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
}

impl Call {
    /// Create a call envelope body.
    pub fn new(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Reply to a prior Call, correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the call being answered.
    pub id: u32,
    /// `Ok(result)` or `Err(error)`. A function without a return value
    /// answers `Ok(Value::Nil)`, which leaves both slots empty on the wire.
    pub outcome: std::result::Result<Value, Value>,
}

impl Response {
    /// Successful response.
    pub fn ok(id: u32, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// Error response.
    pub fn err(id: u32, error: Value) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// Result slot, if this is a success.
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    /// Error slot, if this is a failure.
    pub fn error(&self) -> Option<&Value> {
        self.outcome.as_ref().err()
    }
}

/// A request naming a method that never produces a Response.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Name of the bound function.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
}

impl Notification {
    /// Create a notification envelope body.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// One wire-level message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// See [`Call`].
    Call(Call),
    /// See [`Response`].
    Response(Response),
    /// See [`Notification`].
    Notification(Notification),
}

impl Envelope {
    /// Build the positional array representation.
    pub fn into_value(self) -> Value {
        match self {
            Envelope::Call(call) => Value::Array(vec![
                Value::from(tag::CALL),
                Value::from(call.id),
                Value::from(call.method),
                Value::Array(call.params),
            ]),
            Envelope::Response(response) => {
                let (error, result) = match response.outcome {
                    Ok(result) => (Value::Nil, result),
                    Err(error) => (error, Value::Nil),
                };
                Value::Array(vec![
                    Value::from(tag::RESPONSE),
                    Value::from(response.id),
                    error,
                    result,
                ])
            }
            Envelope::Notification(notification) => Value::Array(vec![
                Value::from(tag::NOTIFICATION),
                Value::from(notification.method),
                Value::Array(notification.params),
            ]),
        }
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::write_value(&self.clone().into_value())
    }

    /// Encode to bytes without cloning.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        MsgPackCodec::write_value(&self.into_value())
    }

    /// Validate a decoded value against the envelope layout.
    ///
    /// # Errors
    ///
    /// [`RpcError::Protocol`] on wrong arity, unknown tag, or a field of the
    /// wrong type.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(protocol("envelope is not an array"));
        };

        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| protocol("envelope tag is not an unsigned integer"))?;

        let expected = match tag {
            tag::CALL | tag::RESPONSE => 4,
            tag::NOTIFICATION => 3,
            other => return Err(RpcError::Protocol(format!("unknown envelope tag {other}"))),
        };
        if items.len() != expected {
            return Err(RpcError::Protocol(format!(
                "envelope with tag {tag} has {} elements, expected {expected}",
                items.len()
            )));
        }

        let mut fields = items.into_iter().skip(1);
        let mut next = || fields.next().unwrap_or(Value::Nil);

        match tag {
            tag::CALL => {
                let id = message_id(next())?;
                let method = method_name(next())?;
                let params = params(next())?;
                Ok(Envelope::Call(Call { id, method, params }))
            }
            tag::RESPONSE => {
                let id = message_id(next())?;
                let error = next();
                let result = next();
                let outcome = if error.is_nil() { Ok(result) } else { Err(error) };
                Ok(Envelope::Response(Response { id, outcome }))
            }
            _ => {
                let method = method_name(next())?;
                let params = params(next())?;
                Ok(Envelope::Notification(Notification { method, params }))
            }
        }
    }
}

impl From<Call> for Envelope {
    fn from(call: Call) -> Self {
        Envelope::Call(call)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Envelope::Response(response)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Envelope::Notification(notification)
    }
}

/// Outcome of an incremental decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A full envelope occupied the first `consumed` bytes.
    Complete {
        /// The decoded envelope.
        envelope: Envelope,
        /// Bytes taken from the front of the input.
        consumed: usize,
    },
    /// The input holds only a prefix of an envelope.
    Incomplete,
}

/// Decode one envelope from the front of `bytes`.
///
/// # Errors
///
/// [`RpcError::Protocol`] if the bytes are not valid MessagePack or the value
/// does not have the envelope layout.
pub fn decode(bytes: &[u8]) -> Result<Decoded> {
    let mut cursor = Cursor::new(bytes);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let consumed = cursor.position() as usize;
            let envelope = Envelope::from_value(value)?;
            Ok(Decoded::Complete { envelope, consumed })
        }
        Err(e) if is_truncated(&e) => Ok(Decoded::Incomplete),
        Err(e) => Err(RpcError::Protocol(format!("invalid msgpack: {e}"))),
    }
}

fn is_truncated(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn protocol(msg: &str) -> RpcError {
    RpcError::Protocol(msg.to_string())
}

fn message_id(value: Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| RpcError::Protocol(format!("message id {value} is not a u32")))
}

fn method_name(value: Value) -> Result<String> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| protocol("method name is not valid UTF-8")),
        other => Err(RpcError::Protocol(format!("method name {other} is not a string"))),
    }
}

fn params(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RpcError::Protocol(format!("params {other} is not an array"))),
    }
}
