//! Error types for packrpc.
//!
//! [`RpcError`] is what every fallible operation returns. Errors that were
//! produced on the remote side travel in a Response's error slot and surface
//! locally as [`RpcError::Remote`], classified by [`RemoteErrorKind`].

use std::fmt;
use std::time::Duration;

use rmpv::Value;
use thiserror::Error;

/// Main error type for all packrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed envelope or byte stream. Fatal to the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value could not be converted into the requested type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// The peer answered the call with an error.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// The session is not open; nothing was written.
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the configured wait bound.
    #[error("Call {id} timed out after {after:?}")]
    Timeout {
        /// Message id of the abandoned call.
        id: u32,
        /// The wait bound that elapsed.
        after: Duration,
    },

    /// Every candidate message id is still outstanding.
    #[error("Message id {0} is still outstanding")]
    IdExhausted(u32),

    /// The listening socket could not be set up.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The outbound connection could not be established.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Requested address.
        addr: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A function is already bound under this name.
    #[error("Function already bound: {0}")]
    DuplicateName(String),

    /// A bound function panicked while exceptions were not suppressed.
    #[error("Function '{method}' panicked: {message}")]
    HandlerPanicked {
        /// Name the function was bound under.
        method: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Backpressure timeout - write queue stayed full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The server was stopped and takes no more work.
    #[error("Server stopped")]
    Stopped,
}

impl RpcError {
    /// Kind of the remote failure, if this error came from the peer.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            RpcError::Remote(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Classification of an error carried in a Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// No function is bound under the called name.
    MethodNotFound,
    /// Parameter count did not match the bound function's arity.
    ArgumentCount,
    /// A parameter could not be decoded into the bound function's type.
    TypeMismatch,
    /// The bound function itself reported the failure.
    Application,
}

impl RemoteErrorKind {
    /// Wire name used in the `kind` field of dispatch errors.
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteErrorKind::MethodNotFound => "MethodNotFound",
            RemoteErrorKind::ArgumentCount => "ArgumentCountError",
            RemoteErrorKind::TypeMismatch => "TypeMismatch",
            RemoteErrorKind::Application => "ApplicationError",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "MethodNotFound" => Some(RemoteErrorKind::MethodNotFound),
            "ArgumentCountError" => Some(RemoteErrorKind::ArgumentCount),
            "TypeMismatch" => Some(RemoteErrorKind::TypeMismatch),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error received in a Response's error slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// What went wrong on the remote side.
    pub kind: RemoteErrorKind,
    /// Human readable description.
    pub message: String,
    /// The raw error value as received.
    pub value: Value,
}

impl RemoteError {
    /// Classify a raw error value.
    ///
    /// Maps of the form `{"kind": .., "message": ..}` with a known kind are
    /// dispatch errors; everything else is an application error.
    pub fn from_value(value: Value) -> Self {
        if let Value::Map(entries) = &value {
            let field = |name: &str| {
                entries
                    .iter()
                    .find(|(k, _)| k.as_str() == Some(name))
                    .and_then(|(_, v)| v.as_str())
            };
            if let Some(kind) = field("kind").and_then(RemoteErrorKind::from_wire) {
                let message = field("message").unwrap_or_default().to_string();
                return Self {
                    kind,
                    message,
                    value,
                };
            }
        }

        let message = match &value {
            Value::String(s) => s.as_str().map(str::to_string).unwrap_or_default(),
            other => other.to_string(),
        };
        Self {
            kind: RemoteErrorKind::Application,
            message,
            value,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Recoverable failure detected while dispatching a Call or Notification.
///
/// Encoded into the Response's error slot for calls; logged for
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Nothing is bound under the requested name.
    #[error("attempted to call nonexistent function '{method}'")]
    MethodNotFound {
        /// Requested name.
        method: String,
    },

    /// Wrong number of parameters.
    #[error("function '{method}' was called with an invalid number of arguments. Expected: {expected}, got: {got}")]
    ArgumentCount {
        /// Requested name.
        method: String,
        /// Arity of the bound function.
        expected: usize,
        /// Number of parameters received.
        got: usize,
    },

    /// A parameter could not be decoded into the expected type.
    #[error("function '{method}': argument {index} has the wrong type: {message}")]
    TypeMismatch {
        /// Requested name.
        method: String,
        /// Zero-based parameter position.
        index: usize,
        /// Decoder message.
        message: String,
    },
}

impl DispatchError {
    /// Remote classification of this error.
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            DispatchError::MethodNotFound { .. } => RemoteErrorKind::MethodNotFound,
            DispatchError::ArgumentCount { .. } => RemoteErrorKind::ArgumentCount,
            DispatchError::TypeMismatch { .. } => RemoteErrorKind::TypeMismatch,
        }
    }

    /// Encode as the `{"kind", "message"}` map placed in the error slot.
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("kind"), Value::from(self.kind().as_str())),
            (Value::from("message"), Value::from(self.to_string())),
        ])
    }
}
