use crate::{Result, SessionError, Value};
use rust_decimal::{Decimal, prelude::FromPrimitive};
use std::any;
use time::PrimitiveDateTime;
use uuid::Uuid;

/// Conversion between native Rust types and the dynamically typed [`Value`] stored in rows.
///
/// Decoding is lenient where no information is lost (an `i32` column read from an `Int64`
/// value in range, a `Decimal` read from an integer) and fails with
/// [`SessionError::Decode`] otherwise.
///
/// ```rust
/// use sluice_core::{AsValue, Value};
/// let v = 42i64.as_value();
/// assert_eq!(v, Value::Int64(Some(42)));
/// let n: i64 = AsValue::try_from_value(v).unwrap();
/// assert_eq!(n, 42);
/// ```
pub trait AsValue {
    /// Typed NULL for this type.
    fn as_empty_value() -> Value;
    fn as_value(self) -> Value;
    fn try_from_value(value: Value) -> Result<Self>
    where
        Self: Sized;
}

pub(crate) fn decode_error<T>(value: &Value) -> SessionError {
    SessionError::Decode {
        expected: any::type_name::<T>(),
        found: format!("{:?}", value),
    }
}

macro_rules! impl_as_value {
    ($source:ty, $variant:ident, $lenient:ident) => {
        impl AsValue for $source {
            fn as_empty_value() -> Value {
                Value::$variant(None)
            }
            fn as_value(self) -> Value {
                Value::$variant(Some(self))
            }
            fn try_from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(Some(v)) => Ok(v),
                    other => $lenient(other),
                }
            }
        }

        impl From<$source> for Value {
            fn from(value: $source) -> Self {
                value.as_value()
            }
        }
    };
}

fn strict<T>(value: Value) -> Result<T> {
    Err(decode_error::<T>(&value))
}

fn bool_from(value: Value) -> Result<bool> {
    match value {
        Value::Int64(Some(v)) => Ok(v != 0),
        _ => Err(decode_error::<bool>(&value)),
    }
}

fn i64_from(value: Value) -> Result<i64> {
    match value {
        Value::Decimal(Some(v)) if v.fract().is_zero() => {
            i64::try_from(v).map_err(|_| decode_error::<i64>(&value))
        }
        _ => Err(decode_error::<i64>(&value)),
    }
}

fn f64_from(value: Value) -> Result<f64> {
    match value {
        Value::Int64(Some(v)) => Ok(v as f64),
        _ => Err(decode_error::<f64>(&value)),
    }
}

fn decimal_from(value: Value) -> Result<Decimal> {
    match value {
        Value::Int64(Some(v)) => Ok(Decimal::from(v)),
        Value::Float64(Some(v)) => Decimal::from_f64(v).ok_or_else(|| decode_error::<Decimal>(&value)),
        _ => Err(decode_error::<Decimal>(&value)),
    }
}

fn uuid_from(value: Value) -> Result<Uuid> {
    match &value {
        Value::Varchar(Some(v)) => Uuid::parse_str(v).map_err(|_| decode_error::<Uuid>(&value)),
        _ => Err(decode_error::<Uuid>(&value)),
    }
}

impl_as_value!(bool, Boolean, bool_from);
impl_as_value!(i64, Int64, i64_from);
impl_as_value!(f64, Float64, f64_from);
impl_as_value!(Decimal, Decimal, decimal_from);
impl_as_value!(String, Varchar, strict);
impl_as_value!(Uuid, Uuid, uuid_from);
impl_as_value!(PrimitiveDateTime, Timestamp, strict);

impl AsValue for i32 {
    fn as_empty_value() -> Value {
        Value::Int64(None)
    }
    fn as_value(self) -> Value {
        Value::Int64(Some(self as i64))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        let v = i64::try_from_value(value.clone())?;
        i32::try_from(v).map_err(|_| decode_error::<i32>(&value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        value.as_value()
    }
}

impl AsValue for u64 {
    fn as_empty_value() -> Value {
        Value::Int64(None)
    }
    fn as_value(self) -> Value {
        match i64::try_from(self) {
            Ok(v) => Value::Int64(Some(v)),
            Err(..) => Value::Decimal(Some(Decimal::from(self))),
        }
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int64(Some(v)) => u64::try_from(v).map_err(|_| decode_error::<u64>(&value)),
            Value::Decimal(Some(v)) if v.fract().is_zero() => {
                u64::try_from(v).map_err(|_| decode_error::<u64>(&value))
            }
            _ => Err(decode_error::<u64>(&value)),
        }
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        value.as_value()
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Varchar(Some(value.to_owned()))
    }
}

impl<T: AsValue> AsValue for Option<T> {
    fn as_empty_value() -> Value {
        T::as_empty_value()
    }
    fn as_value(self) -> Value {
        match self {
            Some(v) => v.as_value(),
            None => T::as_empty_value(),
        }
    }
    fn try_from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::try_from_value(value).map(Some)
        }
    }
}
