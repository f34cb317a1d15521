//! Scalar semantics: operators, conversions and the string/date functions.
//!
//! Null propagates through arithmetic and functions. Comparisons never
//! produce null: ordering against null is false, and null equals only null.

use std::cmp::Ordering;

use chrono::{Datelike, TimeDelta};
use exprtree::{BinaryOp, Method, UnaryOp};
use typereg::{TypeDescriptor, Value};

use crate::errors::{Result, internal, source_err};

/// Equality with null handling and cross-width numeric comparison.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (l, r) if l.as_f64().is_some() && r.as_f64().is_some() => {
            l.compare(r) == Some(Ordering::Equal)
        }
        (l, r) => l == r,
    }
}

/// Default value for a single-element operator that found nothing.
pub fn default_for(ty: &TypeDescriptor) -> Value {
    if *ty == TypeDescriptor::int32() {
        Value::Int32(0)
    } else if *ty == TypeDescriptor::int64() {
        Value::Int64(0)
    } else if *ty == TypeDescriptor::float64() {
        Value::Float64(0.0)
    } else if *ty == TypeDescriptor::bool() {
        Value::Bool(false)
    } else {
        Value::Null
    }
}

fn overflow(op: &str) -> crate::errors::ExecError {
    source_err!("arithmetic overflow in {op}")
}

/// Apply a non-logical binary operator. `ty` is the static result type.
pub fn binary(op: BinaryOp, left: &Value, right: &Value, ty: &TypeDescriptor) -> Result<Value> {
    match op {
        BinaryOp::And | BinaryOp::Or => Err(internal!("logical operators are evaluated lazily")),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Bool(false));
            }
            let result = match left.compare(right) {
                Some(ord) => match op {
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Le => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
                None => false,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add if *ty == TypeDescriptor::string() => {
            let render = |v: &Value| match v {
                Value::Null => String::new(),
                v => v.to_string(),
            };
            Ok(Value::String(format!("{}{}", render(left), render(right))))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            arithmetic(op, left, right, ty)
        }
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value, ty: &TypeDescriptor) -> Result<Value> {
    if *ty == TypeDescriptor::float64() {
        let (l, r) = match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(internal!("non-numeric operands for {}", op.symbol())),
        };
        let v = match op {
            BinaryOp::Add => l + r,
            BinaryOp::Sub => l - r,
            BinaryOp::Mul => l * r,
            BinaryOp::Div => l / r,
            _ => l % r,
        };
        return Ok(Value::Float64(v));
    }

    let (l, r) = match (left.as_i64(), right.as_i64()) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(internal!("non-integer operands for {}", op.symbol())),
    };
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && r == 0 {
        return Err(source_err!("division by zero"));
    }
    let v = match op {
        BinaryOp::Add => l.checked_add(r),
        BinaryOp::Sub => l.checked_sub(r),
        BinaryOp::Mul => l.checked_mul(r),
        BinaryOp::Div => l.checked_div(r),
        _ => l.checked_rem(r),
    }
    .ok_or_else(|| overflow(op.symbol()))?;

    if *ty == TypeDescriptor::int32() {
        let v = i32::try_from(v).map_err(|_| overflow(op.symbol()))?;
        Ok(Value::Int32(v))
    } else {
        Ok(Value::Int64(v))
    }
}

pub fn unary(op: UnaryOp, operand: Value) -> Result<Value> {
    match (op, operand) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Negate, Value::Int32(v)) => v
            .checked_neg()
            .map(Value::Int32)
            .ok_or_else(|| overflow("negation")),
        (UnaryOp::Negate, Value::Int64(v)) => v
            .checked_neg()
            .map(Value::Int64)
            .ok_or_else(|| overflow("negation")),
        (UnaryOp::Negate, Value::Float64(v)) => Ok(Value::Float64(-v)),
        (op, v) => Err(internal!("operator {} applied to {}", op.symbol(), v.kind())),
    }
}

fn float_to_int(v: f64, min: f64, max: f64) -> Option<f64> {
    let v = v.trunc();
    (v.is_finite() && v >= min && v <= max).then_some(v)
}

/// Convert a value to `target`. Numeric narrowing is range checked.
pub fn convert(value: Value, target: &TypeDescriptor) -> Result<Value> {
    let out_of_range = |v: &Value| source_err!("value {v} out of range for {target}");

    let converted = match value {
        Value::Null => Value::Null,
        v if *target == TypeDescriptor::int32() => match v {
            Value::Int32(_) => v,
            Value::Int64(i) => Value::Int32(i32::try_from(i).map_err(|_| out_of_range(&v))?),
            Value::Float64(f) => match float_to_int(f, i32::MIN as f64, i32::MAX as f64) {
                Some(f) => Value::Int32(f as i32),
                None => return Err(out_of_range(&v)),
            },
            other => return Err(internal!("cannot convert {} to {target}", other.kind())),
        },
        v if *target == TypeDescriptor::int64() => match v {
            Value::Int32(i) => Value::Int64(i as i64),
            Value::Int64(_) => v,
            Value::Float64(f) => match float_to_int(f, i64::MIN as f64, i64::MAX as f64) {
                Some(f) => Value::Int64(f as i64),
                None => return Err(out_of_range(&v)),
            },
            other => return Err(internal!("cannot convert {} to {target}", other.kind())),
        },
        v if *target == TypeDescriptor::float64() => match v.as_f64() {
            Some(f) => Value::Float64(f),
            None => return Err(internal!("cannot convert {} to {target}", v.kind())),
        },
        // Identity conversion for everything else, typing guarantees the
        // operand already has the target type.
        v => v,
    };
    Ok(converted)
}

fn string_arg<'v>(method: Method, v: &'v Value) -> Result<&'v str> {
    v.as_str()
        .ok_or_else(|| internal!("{} expects a string, got {}", method.name(), v.kind()))
}

fn int_arg(method: Method, v: &Value) -> Result<i64> {
    v.as_i64()
        .ok_or_else(|| internal!("{} expects an integer, got {}", method.name(), v.kind()))
}

/// Evaluate one of the string/date functions.
pub fn function(method: Method, args: &[Value]) -> Result<Value> {
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let arg = |idx: usize| {
        args.get(idx)
            .ok_or_else(|| internal!("missing argument {idx} for {}", method.name()))
    };

    let value = match method {
        Method::StringContains => {
            Value::Bool(string_arg(method, arg(0)?)?.contains(string_arg(method, arg(1)?)?))
        }
        Method::StartsWith => {
            Value::Bool(string_arg(method, arg(0)?)?.starts_with(string_arg(method, arg(1)?)?))
        }
        Method::EndsWith => {
            Value::Bool(string_arg(method, arg(0)?)?.ends_with(string_arg(method, arg(1)?)?))
        }
        Method::ToUpper => Value::String(string_arg(method, arg(0)?)?.to_uppercase()),
        Method::ToLower => Value::String(string_arg(method, arg(0)?)?.to_lowercase()),
        Method::Trim => Value::String(string_arg(method, arg(0)?)?.trim().to_string()),
        Method::Length => {
            let len = string_arg(method, arg(0)?)?.chars().count();
            Value::Int32(i32::try_from(len).map_err(|_| overflow("Length"))?)
        }
        Method::Substring => {
            let s = string_arg(method, arg(0)?)?;
            let total = s.chars().count() as i64;
            let start = int_arg(method, arg(1)?)?;
            if start < 0 || start > total {
                return Err(source_err!(
                    "substring start {start} out of range for length {total}"
                ));
            }
            let len = match args.get(2) {
                Some(len) => int_arg(method, len)?,
                None => total - start,
            };
            if len < 0 || start + len > total {
                return Err(source_err!(
                    "substring length {len} out of range for length {total}"
                ));
            }
            Value::String(s.chars().skip(start as usize).take(len as usize).collect())
        }
        Method::ToString => Value::String(arg(0)?.to_string()),
        Method::Year | Method::Month | Method::Day => {
            let dt = match arg(0)? {
                Value::DateTime(dt) => dt,
                other => {
                    return Err(internal!("{} expects a datetime, got {}", method.name(), other.kind()));
                }
            };
            let part = match method {
                Method::Year => dt.year(),
                Method::Month => dt.month() as i32,
                _ => dt.day() as i32,
            };
            Value::Int32(part)
        }
        Method::AddDays => {
            let dt = match arg(0)? {
                Value::DateTime(dt) => *dt,
                other => return Err(internal!("AddDays expects a datetime, got {}", other.kind())),
            };
            let days = arg(1)?
                .as_f64()
                .ok_or_else(|| internal!("AddDays expects a number of days"))?;
            let millis = (days * 86_400_000.0).round();
            let shifted = (millis.is_finite() && millis.abs() < i64::MAX as f64)
                .then(|| TimeDelta::try_milliseconds(millis as i64))
                .flatten()
                .and_then(|delta| dt.checked_add_signed(delta))
                .ok_or_else(|| source_err!("datetime out of range after adding {days} days"))?;
            Value::DateTime(shifted)
        }
        other => return Err(internal!("{} is not a scalar function", other.name())),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Value::Null, Value::Null, true)]
    #[case(Value::Null, Value::Int32(0), false)]
    #[case(Value::Int32(5), Value::Int64(5), true)]
    #[case(Value::Int32(5), Value::Float64(5.0), true)]
    #[case(Value::from("a"), Value::from("a"), true)]
    #[case(Value::from("a"), Value::from("b"), false)]
    fn equality(#[case] left: Value, #[case] right: Value, #[case] expected: bool) {
        assert_eq!(expected, values_equal(&left, &right));
    }

    #[test]
    fn comparisons_with_null_are_false() {
        for op in [BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge] {
            let out = binary(op, &Value::Null, &Value::Int32(1), &TypeDescriptor::bool()).unwrap();
            assert_eq!(Value::Bool(false), out);
        }
    }

    #[test]
    fn arithmetic_null_and_overflow() {
        let int32 = TypeDescriptor::int32();
        assert_eq!(
            Value::Null,
            binary(BinaryOp::Add, &Value::Null, &Value::Int32(1), &int32).unwrap()
        );
        assert!(binary(BinaryOp::Add, &Value::Int32(i32::MAX), &Value::Int32(1), &int32).is_err());
        assert!(binary(BinaryOp::Div, &Value::Int32(1), &Value::Int32(0), &int32).is_err());
        assert_eq!(
            Value::Int64(7),
            binary(BinaryOp::Add, &Value::Int32(2), &Value::Int64(5), &TypeDescriptor::int64()).unwrap()
        );
    }

    #[test]
    fn string_concat_renders_null_empty() {
        let out = binary(
            BinaryOp::Add,
            &Value::from("id-"),
            &Value::Null,
            &TypeDescriptor::string(),
        )
        .unwrap();
        assert_eq!(Value::from("id-"), out);
    }

    #[test]
    fn narrowing_conversion() {
        assert_eq!(
            Value::Int32(3),
            convert(Value::Float64(3.9), &TypeDescriptor::int32()).unwrap()
        );
        assert!(convert(Value::Int64(i64::MAX), &TypeDescriptor::int32()).is_err());
        assert_eq!(Value::Null, convert(Value::Null, &TypeDescriptor::int32()).unwrap());
    }

    #[test]
    fn substring_bounds() {
        let s = Value::from("Research");
        assert_eq!(
            Value::from("search"),
            function(Method::Substring, &[s.clone(), Value::Int32(2)]).unwrap()
        );
        assert_eq!(
            Value::from("Res"),
            function(Method::Substring, &[s.clone(), Value::Int32(0), Value::Int32(3)]).unwrap()
        );
        assert!(function(Method::Substring, &[s, Value::Int32(9)]).is_err());
    }

    #[test]
    fn date_parts_and_add_days() {
        let dt = NaiveDate::from_ymd_opt(1982, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            Value::Int32(1982),
            function(Method::Year, &[Value::DateTime(dt)]).unwrap()
        );
        let shifted = function(Method::AddDays, &[Value::DateTime(dt), Value::Int32(-1)]).unwrap();
        let expected = NaiveDate::from_ymd_opt(1982, 2, 28)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(Value::DateTime(expected), shifted);
    }

    #[test]
    fn functions_propagate_null() {
        assert_eq!(
            Value::Null,
            function(Method::ToUpper, &[Value::Null]).unwrap()
        );
    }
}
