//! Argument tuples to positional params.

use rmpv::Value;
use serde::Serialize;

use super::MsgPackCodec;
use crate::error::Result;

/// Argument lists a client can send.
///
/// Implemented for `()` and tuples of up to eight `Serialize` values. Each
/// tuple element is exactly one positional parameter, whatever it encodes
/// to: `(vec![1, 2, 3],)` is one array parameter and `(None::<i32>,)` is
/// one nil parameter.
pub trait IntoParams {
    /// Encode each argument as one parameter.
    fn into_params(self) -> Result<Vec<Value>>;
}

macro_rules! impl_into_params {
    ($($ty:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($ty: Serialize,)*> IntoParams for ($($ty,)*) {
            fn into_params(self) -> Result<Vec<Value>> {
                let ($($ty,)*) = self;
                Ok(vec![$(MsgPackCodec::to_value(&$ty)?),*])
            }
        }
    };
}

impl_into_params!();
impl_into_params!(A1);
impl_into_params!(A1, A2);
impl_into_params!(A1, A2, A3);
impl_into_params!(A1, A2, A3, A4);
impl_into_params!(A1, A2, A3, A4, A5);
impl_into_params!(A1, A2, A3, A4, A5, A6);
impl_into_params!(A1, A2, A3, A4, A5, A6, A7);
impl_into_params!(A1, A2, A3, A4, A5, A6, A7, A8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_is_no_params() {
        assert_eq!(().into_params().unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_each_element_is_one_param() {
        assert_eq!(("a",).into_params().unwrap(), vec![Value::from("a")]);
        assert_eq!(
            (1, true).into_params().unwrap(),
            vec![Value::from(1), Value::from(true)]
        );
    }

    #[test]
    fn test_sequence_argument_stays_whole() {
        let params = (vec![1, 2, 3],).into_params().unwrap();
        assert_eq!(
            params,
            vec![Value::Array(vec![Value::from(1), Value::from(2), Value::from(3)])]
        );
    }

    #[test]
    fn test_none_argument_is_nil_param() {
        assert_eq!((None::<i32>,).into_params().unwrap(), vec![Value::Nil]);
    }

    #[test]
    fn test_nested_tuple_argument() {
        let params = ((1, 2), "x").into_params().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], Value::Array(vec![Value::from(1), Value::from(2)]));
    }
}
