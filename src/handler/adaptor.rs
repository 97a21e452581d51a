//! Type-erased adaptors for bound functions.
//!
//! Any `Fn(A1, .., An) -> R` with `n <= 8`, `Ai: DeserializeOwned` and
//! `R: IntoReply` can be bound. At bind time it is wrapped once in a
//! [`TypedHandler`], which knows how to decode exactly those parameter types
//! and encode exactly that return type, and stored behind the uniform
//! [`Handler`] interface.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::DispatchError;

/// What a bound function produced: `Ok(result)` or `Err(application error)`.
pub type Invocation = std::result::Result<Value, Value>;

/// Uniform interface over every bound function.
pub trait Handler: Send + Sync + 'static {
    /// Number of parameters the function takes.
    fn arity(&self) -> usize;

    /// Decode `params`, run the function, encode its reply.
    ///
    /// `params.len()` has already been checked against [`Handler::arity`].
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Invocation, DispatchError>;
}

/// Functions that can be bound, keyed by their argument tuple.
///
/// Implemented for closures and fn items of up to eight arguments.
pub trait IntoHandler<Args>: Send + Sync + Sized + 'static {
    /// Number of parameters.
    const ARITY: usize;

    /// Decode arguments, call, and convert the return value.
    fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Invocation, DispatchError>;
}

/// Wrapper that fixes the argument tuple of a bound function.
pub struct TypedHandler<F, Args> {
    handler: F,
    _phantom: PhantomData<fn(Args)>,
}

impl<F, Args> TypedHandler<F, Args>
where
    F: IntoHandler<Args>,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Args> Handler for TypedHandler<F, Args>
where
    F: IntoHandler<Args>,
    Args: 'static,
{
    fn arity(&self) -> usize {
        F::ARITY
    }

    fn call(&self, method: &str, params: Vec<Value>) -> Result<Invocation, DispatchError> {
        self.handler.invoke(method, params)
    }
}

fn decode_param<T: DeserializeOwned>(
    method: &str,
    index: usize,
    value: Option<Value>,
) -> Result<T, DispatchError> {
    let value = value.unwrap_or(Value::Nil);
    MsgPackCodec::from_value(&value).map_err(|e| DispatchError::TypeMismatch {
        method: method.to_string(),
        index,
        message: e.to_string(),
    })
}

macro_rules! impl_into_handler {
    ($arity:expr; $($ty:ident $idx:tt),*) => {
        #[allow(non_snake_case, unused_variables, unused_mut)]
        impl<F, R, $($ty,)*> IntoHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: IntoReply,
            $($ty: DeserializeOwned,)*
        {
            const ARITY: usize = $arity;

            fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Invocation, DispatchError> {
                let mut params = params.into_iter();
                $(
                    let $ty: $ty = decode_param(method, $idx, params.next())?;
                )*
                Ok((self)($($ty),*).into_reply())
            }
        }
    };
}

impl_into_handler!(0;);
impl_into_handler!(1; A1 0);
impl_into_handler!(2; A1 0, A2 1);
impl_into_handler!(3; A1 0, A2 1, A3 2);
impl_into_handler!(4; A1 0, A2 1, A3 2, A4 3);
impl_into_handler!(5; A1 0, A2 1, A3 2, A4 3, A5 4);
impl_into_handler!(6; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5);
impl_into_handler!(7; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5, A7 6);
impl_into_handler!(8; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5, A7 6, A8 7);

/// Return types a bound function may have.
///
/// `()` leaves both Response slots empty. `Result<T, E>` reports `Err(e)` as
/// an application error carrying `e.to_string()`. Arbitrary `Serialize` types
/// are returned through [`Msgpack`].
pub trait IntoReply {
    /// Convert into the Response payload.
    fn into_reply(self) -> Invocation;
}

fn encode_reply<T: Serialize + ?Sized>(value: &T) -> Invocation {
    MsgPackCodec::to_value(value).map_err(|e| Value::from(format!("failed to encode result: {e}")))
}

macro_rules! impl_into_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> Invocation {
                    encode_reply(&self)
                }
            }
        )*
    };
}

impl_into_reply!(
    bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, char, String,
    &'static str,
);

impl IntoReply for () {
    fn into_reply(self) -> Invocation {
        Ok(Value::Nil)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Invocation {
        Ok(self)
    }
}

impl<T: Serialize> IntoReply for Vec<T> {
    fn into_reply(self) -> Invocation {
        encode_reply(&self)
    }
}

impl<T: Serialize> IntoReply for Option<T> {
    fn into_reply(self) -> Invocation {
        encode_reply(&self)
    }
}

impl<K, V, S> IntoReply for HashMap<K, V, S>
where
    K: Serialize + Eq + Hash,
    V: Serialize,
    S: BuildHasher,
{
    fn into_reply(self) -> Invocation {
        encode_reply(&self)
    }
}

impl<K: Serialize, V: Serialize> IntoReply for BTreeMap<K, V> {
    fn into_reply(self) -> Invocation {
        encode_reply(&self)
    }
}

impl<T: IntoReply, E: Display> IntoReply for Result<T, E> {
    fn into_reply(self) -> Invocation {
        match self {
            Ok(value) => value.into_reply(),
            Err(e) => Err(Value::from(e.to_string())),
        }
    }
}

/// Return any `Serialize` value from a bound function.
///
/// ```
/// use packrpc::handler::{Dispatcher, Msgpack};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Point { x: i32, y: i32 }
///
/// let mut dispatcher = Dispatcher::new();
/// dispatcher.bind("origin", || Msgpack(Point { x: 0, y: 0 })).unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msgpack<T>(pub T);

impl<T: Serialize> IntoReply for Msgpack<T> {
    fn into_reply(self) -> Invocation {
        encode_reply(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn erase<F, Args>(f: F) -> Box<dyn Handler>
    where
        F: IntoHandler<Args>,
        Args: 'static,
    {
        Box::new(TypedHandler::new(f))
    }

    #[test]
    fn test_arity_from_signature() {
        assert_eq!(erase(|| ()).arity(), 0);
        assert_eq!(erase(|_: i32| ()).arity(), 1);
        assert_eq!(erase(|_: i32, _: String, _: bool| ()).arity(), 3);
        assert_eq!(
            erase(|_: u8, _: u8, _: u8, _: u8, _: u8, _: u8, _: u8, _: u8| ()).arity(),
            8
        );
    }

    #[test]
    fn test_call_decodes_and_encodes() {
        let add = erase(|a: i64, b: i64| a + b);
        let out = add.call("add", vec![Value::from(2), Value::from(40)]).unwrap();
        assert_eq!(out, Ok(Value::from(42)));
    }

    #[test]
    fn test_void_function_returns_nil() {
        let noop = erase(|_: String| ());
        assert_eq!(noop.call("noop", vec![Value::from("x")]).unwrap(), Ok(Value::Nil));
    }

    #[test]
    fn test_fn_item() {
        fn shout(s: String) -> String {
            s.to_uppercase()
        }
        let handler = erase(shout);
        assert_eq!(
            handler.call("shout", vec![Value::from("hey")]).unwrap(),
            Ok(Value::from("HEY"))
        );
    }

    #[test]
    fn test_application_error() {
        let div = erase(|a: i32, b: i32| {
            if b == 0 {
                Err("division by zero")
            } else {
                Ok(a / b)
            }
        });

        assert_eq!(div.call("div", vec![Value::from(6), Value::from(3)]).unwrap(), Ok(Value::from(2)));
        assert_eq!(
            div.call("div", vec![Value::from(1), Value::from(0)]).unwrap(),
            Err(Value::from("division by zero"))
        );
    }

    #[test]
    fn test_type_mismatch_reports_index() {
        let handler = erase(|_: i32, _: String| ());
        let err = handler
            .call("f", vec![Value::from(1), Value::from(2)])
            .unwrap_err();

        assert!(matches!(err, DispatchError::TypeMismatch { index: 1, .. }));
    }

    #[test]
    fn test_struct_reply_is_map() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let handler = erase(|| Msgpack(Point { x: 1, y: 2 }));
        let out = handler.call("p", vec![]).unwrap().unwrap();
        assert_eq!(
            out,
            Value::Map(vec![
                (Value::from("x"), Value::from(1)),
                (Value::from("y"), Value::from(2)),
            ])
        );
    }

    #[test]
    fn test_struct_arguments() {
        #[derive(serde::Deserialize)]
        struct Req {
            name: String,
        }

        let handler = erase(|r: Req| format!("hello {}", r.name));
        let arg = Value::Map(vec![(Value::from("name"), Value::from("bob"))]);
        assert_eq!(handler.call("greet", vec![arg]).unwrap(), Ok(Value::from("hello bob")));
    }
}
