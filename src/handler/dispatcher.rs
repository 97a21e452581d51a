//! Name to function registry and invocation.
//!
//! # Example
//!
//! ```
//! use packrpc::handler::Dispatcher;
//! use packrpc::protocol::{Call, Envelope};
//! use rmpv::Value;
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.bind("add", |a: i64, b: i64| a + b).unwrap();
//!
//! let call = Envelope::Call(Call::new(1, "add", vec![Value::from(2), Value::from(3)]));
//! let response = dispatcher.dispatch(call, false).unwrap().unwrap();
//! assert_eq!(response.result(), Some(&Value::from(5)));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rmpv::Value;

use super::adaptor::{Handler, IntoHandler, TypedHandler};
use crate::error::{DispatchError, Result, RpcError};
use crate::protocol::{Call, Envelope, Notification, Response};

/// Registry mapping names to bound functions.
///
/// Dispatching only reads the registry and may run on many threads at once.
/// Cloning is cheap: bound functions are shared, not copied.
#[derive(Default, Clone)]
pub struct Dispatcher {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    /// Create a new empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `function` under `name`.
    ///
    /// The argument decoding and result encoding for the function's concrete
    /// signature is built here, once.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateName`] if `name` is already bound; the existing
    /// binding is left untouched.
    pub fn bind<F, Args>(&mut self, name: &str, function: F) -> Result<()>
    where
        F: IntoHandler<Args>,
        Args: 'static,
    {
        if self.methods.contains_key(name) {
            return Err(RpcError::DuplicateName(name.to_string()));
        }

        tracing::debug!(method = name, arity = F::ARITY, "Binding function");
        self.methods
            .insert(name.to_string(), Arc::new(TypedHandler::new(function)));
        Ok(())
    }

    /// Check whether a function is bound under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Arity of the function bound under `name`.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.methods.get(name).map(|h| h.arity())
    }

    /// Names of all bound functions, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of bound functions.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Check if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Dispatch one incoming envelope.
    ///
    /// Calls always produce a Response; dispatch errors and application
    /// errors go into its error slot. Notifications never produce one.
    ///
    /// # Errors
    ///
    /// [`RpcError::HandlerPanicked`] if the function panicked and
    /// `suppress_exceptions` is off. The caller decides what to do with the
    /// connection.
    pub fn dispatch(&self, envelope: Envelope, suppress_exceptions: bool) -> Result<Option<Response>> {
        match envelope {
            Envelope::Call(call) => self.dispatch_call(call, suppress_exceptions).map(Some),
            Envelope::Notification(notification) => {
                self.dispatch_notification(notification, suppress_exceptions)?;
                Ok(None)
            }
            Envelope::Response(response) => {
                tracing::warn!(id = response.id, "Dispatcher received a response, dropping");
                Ok(None)
            }
        }
    }

    fn dispatch_call(&self, call: Call, suppress_exceptions: bool) -> Result<Response> {
        let Call { id, method, params } = call;
        tracing::trace!(id, method = %method, "Dispatching call");

        let outcome = self.invoke(&method, params, suppress_exceptions)?;
        Ok(Response { id, outcome })
    }

    fn dispatch_notification(
        &self,
        notification: Notification,
        suppress_exceptions: bool,
    ) -> Result<()> {
        let Notification { method, params } = notification;
        tracing::trace!(method = %method, "Dispatching notification");

        if let Err(error) = self.invoke(&method, params, suppress_exceptions)? {
            tracing::warn!(method = %method, error = %error, "Notification failed");
        }
        Ok(())
    }

    /// Look up, validate, and run a function. The inner `Err` is the value
    /// destined for the Response's error slot.
    fn invoke(
        &self,
        method: &str,
        params: Vec<Value>,
        suppress_exceptions: bool,
    ) -> Result<std::result::Result<Value, Value>> {
        let Some(handler) = self.methods.get(method) else {
            let err = DispatchError::MethodNotFound {
                method: method.to_string(),
            };
            tracing::debug!("{}", err);
            return Ok(Err(err.to_value()));
        };

        if params.len() != handler.arity() {
            let err = DispatchError::ArgumentCount {
                method: method.to_string(),
                expected: handler.arity(),
                got: params.len(),
            };
            tracing::debug!("{}", err);
            return Ok(Err(err.to_value()));
        }

        match catch_unwind(AssertUnwindSafe(|| handler.call(method, params))) {
            Ok(Ok(invocation)) => Ok(invocation),
            Ok(Err(err)) => {
                tracing::debug!("{}", err);
                Ok(Err(err.to_value()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if suppress_exceptions {
                    tracing::error!(method, "Function panicked (suppressed): {}", message);
                    Ok(Err(Value::from(format!(
                        "function '{method}' panicked: {message}"
                    ))))
                } else {
                    Err(RpcError::HandlerPanicked {
                        method: method.to_string(),
                        message,
                    })
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
