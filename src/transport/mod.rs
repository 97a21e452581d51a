//! Transport module - TCP socket setup.
//!
//! Sockets are opened with the blocking std API so that bind and connect
//! failures surface synchronously to the caller, then handed to tokio.

mod tcp;

pub use tcp::{bind_listener, configure_stream, connect_stream, endpoint};
