use chrono::NaiveDateTime;

use crate::descriptor::TypeDescriptor;
use crate::errors::{Result, TypeError};
use crate::value::Value;

/// Conversion from a decoded [`Value`] into a native Rust type.
pub trait FromValue: Sized {
    /// Descriptor this type corresponds to, used for error reporting.
    fn descriptor() -> TypeDescriptor;

    fn from_value(value: Value) -> Result<Self>;
}

fn incompatible<T: FromValue>(value: &Value) -> TypeError {
    TypeError::Incompatible {
        kind: value.kind(),
        expected: T::descriptor(),
    }
}

impl FromValue for Value {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("value", Vec::new(), 0)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::bool()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl FromValue for i32 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::int32()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int32(v) => Ok(v),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl FromValue for i64 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::int64()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int32(v) => Ok(v as i64),
            Value::Int64(v) => Ok(v),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl FromValue for f64 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::float64()
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| incompatible::<Self>(&value))
    }
}

impl FromValue for String {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::string()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(v) => Ok(v),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::datetime()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTime(v) => Ok(v),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn descriptor() -> TypeDescriptor {
        T::descriptor()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::list(T::descriptor())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(values) => values.into_iter().map(T::from_value).collect(),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives() {
        assert_eq!(13, i32::from_value(Value::Int32(13)).unwrap());
        assert_eq!(96000, i64::from_value(Value::Int64(96000)).unwrap());
        assert_eq!(2.5, f64::from_value(Value::Float64(2.5)).unwrap());
        assert!(bool::from_value(Value::Bool(true)).unwrap());
    }

    #[test]
    fn nullable() {
        assert_eq!(None, Option::<String>::from_value(Value::Null).unwrap());
        assert_eq!(
            Some("Import".to_string()),
            Option::<String>::from_value(Value::from("Import")).unwrap()
        );
    }

    #[test]
    fn wrong_kind() {
        let err = i32::from_value(Value::from("13")).unwrap_err();
        assert!(matches!(err, TypeError::Incompatible { kind: "string", .. }), "{err}");
    }

    #[test]
    fn lists() {
        let vals = Value::List(vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(vec![1, 2], Vec::<i32>::from_value(vals).unwrap());
    }
}
