//! # packrpc
//!
//! MessagePack-RPC over TCP.
//!
//! One process binds named functions on a [`Server`]; another invokes them
//! through a [`Client`], blocking or through a [`CallHandle`], with an
//! optional per-call wait bound. Arguments are tuples: each element is one
//! positional parameter (see [`IntoParams`]).
//!
//! ## Architecture
//!
//! - **Wire**: back-to-back msgpack arrays, `[0, id, method, params]` for a
//!   call, `[1, id, error, result]` for a response, `[2, method, params]` for
//!   a notification
//! - **Sessions**: one per connection, a read loop plus a FIFO writer on a
//!   tokio runtime
//! - **Reactor**: server-side dispatch jobs from every session share one
//!   queue, driven by `run`/`poll` or by `async_run(n)` workers
//!
//! ## Example
//!
//! ```no_run
//! use packrpc::{Client, Server};
//!
//! fn main() -> packrpc::Result<()> {
//!     let server = Server::with_address("127.0.0.1", 8080)?;
//!     server.bind("add", |a: i64, b: i64| a + b)?;
//!     server.async_run(2)?;
//!
//!     let client = Client::connect("127.0.0.1", 8080)?;
//!     let sum: i64 = client.call("add", (2, 3))?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reactor;
pub mod session;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use client::{CallHandle, Client, ClientBuilder, ClientConfig, DEFAULT_RECONNECT_INTERVAL};
pub use codec::IntoParams;
pub use error::{RemoteError, RemoteErrorKind, Result, RpcError};
pub use handler::{Dispatcher, Msgpack};
pub use server::{Server, ServerBuilder, ServerConfig, DEFAULT_PORT};
pub use session::{Session, SessionId, SessionState};
