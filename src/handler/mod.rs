//! Handler module - function binding and dispatch.
//!
//! Provides:
//! - [`Dispatcher`] - maps method names to bound functions
//! - [`IntoHandler`] / [`IntoReply`] - what a bindable function looks like
//!
//! # Example
//!
//! ```
//! use packrpc::handler::Dispatcher;
//!
//! let mut dispatcher = Dispatcher::new();
//!
//! dispatcher.bind("echo", |s: String| s).unwrap();
//! dispatcher.bind("add", |a: i64, b: i64| a + b).unwrap();
//! dispatcher
//!     .bind("div", |a: f64, b: f64| {
//!         if b == 0.0 {
//!             Err("division by zero")
//!         } else {
//!             Ok(a / b)
//!         }
//!     })
//!     .unwrap();
//!
//! assert!(dispatcher.bind("echo", |s: String| s).is_err());
//! ```

mod adaptor;
mod dispatcher;

pub use adaptor::{Handler, IntoHandler, IntoReply, Invocation, Msgpack, TypedHandler};
pub use dispatcher::Dispatcher;
