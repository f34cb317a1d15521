use std::fmt::Debug;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime};

use crate::descriptor::{TypeDescriptor, names};
use crate::errors::{Result, TypeError};
use crate::registry::TypeRegistry;
use crate::value::{Grouping, Record, Value};
use crate::wire;

/// Encodes and decodes object values.
///
/// The same codec is used for constants embedded in expression trees and
/// for result elements, so a value survives any path through the system
/// unchanged.
pub trait ValueCodec: Send + Sync + Debug {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<()>;

    /// Decode one value, checking it against the expected type.
    fn decode(&self, buf: &mut Bytes, expected: &TypeDescriptor) -> Result<Value>;
}

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT32: u8 = 2;
    pub const INT64: u8 = 3;
    pub const FLOAT64: u8 = 4;
    pub const STRING: u8 = 5;
    pub const DATETIME: u8 = 6;
    pub const RECORD: u8 = 7;
    pub const LIST: u8 = 8;
    pub const GROUPING: u8 = 9;
    pub const DICTIONARY: u8 = 10;
}

const MAX_VALUE_DEPTH: usize = 64;

/// Default tagged binary encoding.
///
/// Every value carries its own tag so decoding never depends on the expected
/// type for framing. The expected type is only used to check compatibility
/// and to widen numbers (int32 -> int64 -> float64).
///
/// When constructed with a registry, entity record fields are checked
/// against the registered member types too.
#[derive(Debug, Clone, Default)]
pub struct BinaryValueCodec {
    registry: Option<Arc<TypeRegistry>>,
}

impl BinaryValueCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<TypeRegistry>) -> Self {
        BinaryValueCodec {
            registry: Some(registry),
        }
    }

    fn decode_inner(
        &self,
        buf: &mut Bytes,
        expected: Option<&TypeDescriptor>,
        depth: usize,
    ) -> Result<Value> {
        if depth > MAX_VALUE_DEPTH {
            return Err(TypeError::Decode("value nested too deeply".to_string()));
        }

        let tag = wire::get_u8(buf, "value tag")?;
        let value = match tag {
            tag::NULL => Value::Null,
            tag::BOOL => Value::Bool(wire::get_u8(buf, "bool")? != 0),
            tag::INT32 => Value::Int32(wire::get_i32(buf, "int32")?),
            tag::INT64 => Value::Int64(wire::get_i64(buf, "int64")?),
            tag::FLOAT64 => Value::Float64(wire::get_f64(buf, "float64")?),
            tag::STRING => Value::String(wire::get_str(buf, "string")?),
            tag::DATETIME => {
                let secs = wire::get_i64(buf, "datetime seconds")?;
                let nanos = wire::get_u32(buf, "datetime nanoseconds")?;
                let dt = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
                    TypeError::Decode(format!("datetime out of range: {secs}s {nanos}ns"))
                })?;
                Value::DateTime(dt.naive_utc())
            }
            tag::RECORD => {
                let shape = wire::get_descriptor(buf)?;
                if let Some(expected) = expected {
                    if *expected != shape {
                        return Err(TypeError::Incompatible {
                            kind: "record",
                            expected: expected.clone(),
                        });
                    }
                }
                let count = wire::get_u32(buf, "record field count")?;
                let mut fields = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let name = wire::get_str(buf, "record field name")?;
                    let field_ty = self.field_type(&shape, &name)?;
                    let value = self.decode_inner(buf, field_ty.as_ref(), depth + 1)?;
                    fields.push((name, value));
                }
                return Ok(Value::Record(Record::new(shape, fields)));
            }
            tag::LIST => {
                let element = match expected {
                    Some(expected) => match expected.enumerable_element() {
                        Some(element) if expected.grouping_key().is_none() => Some(element),
                        _ => {
                            return Err(TypeError::Incompatible {
                                kind: "list",
                                expected: expected.clone(),
                            });
                        }
                    },
                    None => None,
                };
                let count = wire::get_u32(buf, "list length")?;
                let mut values = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    values.push(self.decode_inner(buf, element, depth + 1)?);
                }
                return Ok(Value::List(values));
            }
            tag::GROUPING => {
                let (key_ty, element_ty) = match expected {
                    Some(expected) => match (expected.grouping_key(), expected.enumerable_element()) {
                        (Some(key), Some(element)) => (Some(key), Some(element)),
                        _ => {
                            return Err(TypeError::Incompatible {
                                kind: "grouping",
                                expected: expected.clone(),
                            });
                        }
                    },
                    None => (None, None),
                };
                let key = self.decode_inner(buf, key_ty, depth + 1)?;
                let count = wire::get_u32(buf, "grouping length")?;
                let mut elements = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    elements.push(self.decode_inner(buf, element_ty, depth + 1)?);
                }
                return Ok(Value::Grouping(Box::new(Grouping { key, elements })));
            }
            tag::DICTIONARY => {
                let (key_ty, value_ty) = match expected {
                    Some(expected) => match (expected.name.as_str(), expected.args.as_slice()) {
                        (names::DICTIONARY, [k, v]) => (Some(k), Some(v)),
                        _ => {
                            return Err(TypeError::Incompatible {
                                kind: "dictionary",
                                expected: expected.clone(),
                            });
                        }
                    },
                    None => (None, None),
                };
                let count = wire::get_u32(buf, "dictionary length")?;
                let mut pairs = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let k = self.decode_inner(buf, key_ty, depth + 1)?;
                    let v = self.decode_inner(buf, value_ty, depth + 1)?;
                    pairs.push((k, v));
                }
                return Ok(Value::Dictionary(pairs));
            }
            other => return Err(TypeError::Decode(format!("unknown value tag {other}"))),
        };

        match expected {
            Some(expected) => coerce_scalar(value, expected),
            None => Ok(value),
        }
    }

    /// Expected type of a record field, if known.
    fn field_type(&self, shape: &TypeDescriptor, field: &str) -> Result<Option<TypeDescriptor>> {
        if let Some(fields) = shape.anonymous_fields() {
            return match fields.into_iter().find(|(name, _)| *name == field) {
                Some((_, ty)) => Ok(Some(ty.clone())),
                None => Err(TypeError::Decode(format!(
                    "field '{field}' is not part of {shape}"
                ))),
            };
        }
        match &self.registry {
            Some(registry) => match registry.member_type(shape, field)? {
                Some(ty) => Ok(Some(ty)),
                None => Err(TypeError::Decode(format!(
                    "member '{field}' is not part of {shape}"
                ))),
            },
            None => Ok(None),
        }
    }
}

/// Check a primitive value against the expected type, widening numbers.
fn coerce_scalar(value: Value, expected: &TypeDescriptor) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    let name = if expected.args.is_empty() {
        expected.name.as_str()
    } else {
        ""
    };
    let coerced = match (value, name) {
        (v @ Value::Bool(_), names::BOOL) => v,
        (v @ Value::Int32(_), names::INT32) => v,
        (Value::Int32(v), names::INT64) => Value::Int64(v as i64),
        (Value::Int32(v), names::FLOAT64) => Value::Float64(v as f64),
        (v @ Value::Int64(_), names::INT64) => v,
        (Value::Int64(v), names::FLOAT64) => Value::Float64(v as f64),
        (v @ Value::Float64(_), names::FLOAT64) => v,
        (v @ Value::String(_), names::STRING) => v,
        (v @ Value::DateTime(_), names::DATETIME) => v,
        (v, _) => {
            return Err(TypeError::Incompatible {
                kind: v.kind(),
                expected: expected.clone(),
            });
        }
    };
    Ok(coerced)
}

/// Seconds since the epoch and the nanosecond remainder.
fn encode_datetime(buf: &mut BytesMut, dt: &NaiveDateTime) {
    let dt = dt.and_utc();
    buf.put_i64(dt.timestamp());
    buf.put_u32(dt.timestamp_subsec_nanos());
}

impl ValueCodec for BinaryValueCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        match value {
            Value::Null => buf.put_u8(tag::NULL),
            Value::Bool(v) => {
                buf.put_u8(tag::BOOL);
                buf.put_u8(*v as u8);
            }
            Value::Int32(v) => {
                buf.put_u8(tag::INT32);
                buf.put_i32(*v);
            }
            Value::Int64(v) => {
                buf.put_u8(tag::INT64);
                buf.put_i64(*v);
            }
            Value::Float64(v) => {
                buf.put_u8(tag::FLOAT64);
                buf.put_f64(*v);
            }
            Value::String(v) => {
                buf.put_u8(tag::STRING);
                wire::put_str(buf, v);
            }
            Value::DateTime(v) => {
                buf.put_u8(tag::DATETIME);
                encode_datetime(buf, v);
            }
            Value::Record(rec) => {
                buf.put_u8(tag::RECORD);
                wire::put_descriptor(buf, &rec.shape);
                buf.put_u32(rec.fields.len() as u32);
                for (name, v) in &rec.fields {
                    wire::put_str(buf, name);
                    self.encode(v, buf)?;
                }
            }
            Value::List(values) => {
                buf.put_u8(tag::LIST);
                buf.put_u32(values.len() as u32);
                for v in values {
                    self.encode(v, buf)?;
                }
            }
            Value::Grouping(group) => {
                buf.put_u8(tag::GROUPING);
                self.encode(&group.key, buf)?;
                buf.put_u32(group.elements.len() as u32);
                for v in &group.elements {
                    self.encode(v, buf)?;
                }
            }
            Value::Dictionary(pairs) => {
                buf.put_u8(tag::DICTIONARY);
                buf.put_u32(pairs.len() as u32);
                for (k, v) in pairs {
                    self.encode(k, buf)?;
                    self.encode(v, buf)?;
                }
            }
        }
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes, expected: &TypeDescriptor) -> Result<Value> {
        self.decode_inner(buf, Some(expected), 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rstest::rstest;

    use super::*;
    use crate::registry::{EntitySchema, MemberSchema, TypeRegistryBuilder};

    fn round_trip(codec: &BinaryValueCodec, value: &Value, ty: &TypeDescriptor) -> Result<Value> {
        let mut buf = BytesMut::new();
        codec.encode(value, &mut buf)?;
        let mut bytes = buf.freeze();
        let out = codec.decode(&mut bytes, ty)?;
        assert!(bytes.is_empty(), "trailing bytes after decode");
        Ok(out)
    }

    #[test]
    fn nested_values_survive() {
        let foundation = NaiveDate::from_ymd_opt(1982, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let shape = TypeDescriptor::anonymous([
            ("Name", TypeDescriptor::string()),
            ("Founded", TypeDescriptor::datetime()),
            ("Grades", TypeDescriptor::list(TypeDescriptor::int32())),
        ]);
        let value = Value::Record(Record::new(
            shape.clone(),
            vec![
                ("Name".to_string(), Value::from("Research")),
                ("Founded".to_string(), Value::DateTime(foundation)),
                (
                    "Grades".to_string(),
                    Value::List(vec![Value::Int32(8), Value::Null]),
                ),
            ],
        ));

        let codec = BinaryValueCodec::new();
        assert_eq!(value, round_trip(&codec, &value, &shape).unwrap());
    }

    #[rstest]
    #[case::int32_to_int64(Value::Int32(7), TypeDescriptor::int64(), Value::Int64(7))]
    #[case::int32_to_float(Value::Int32(7), TypeDescriptor::float64(), Value::Float64(7.0))]
    #[case::int64_to_float(Value::Int64(-3), TypeDescriptor::float64(), Value::Float64(-3.0))]
    #[case::null_anything(Value::Null, TypeDescriptor::entity("Employee", 1), Value::Null)]
    fn widening(#[case] input: Value, #[case] ty: TypeDescriptor, #[case] expected: Value) {
        let codec = BinaryValueCodec::new();
        let out = round_trip(&codec, &input, &ty).unwrap();
        assert_eq!(expected, out);
        assert_eq!(expected.kind(), out.kind());
    }

    #[rstest]
    #[case::narrowing(Value::Int64(7), TypeDescriptor::int32())]
    #[case::string_as_int(Value::from("7"), TypeDescriptor::int32())]
    #[case::float_as_int(Value::Float64(1.5), TypeDescriptor::int64())]
    #[case::list_as_scalar(Value::List(Vec::new()), TypeDescriptor::string())]
    fn incompatible(#[case] input: Value, #[case] ty: TypeDescriptor) {
        let codec = BinaryValueCodec::new();
        let err = round_trip(&codec, &input, &ty).unwrap_err();
        assert!(matches!(err, TypeError::Incompatible { .. }), "{err}");
    }

    #[test]
    fn entity_members_checked_with_registry() {
        let employee = TypeDescriptor::entity("Employee", 1);
        let registry = TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                employee.clone(),
                vec![MemberSchema::new("Salary", TypeDescriptor::int64())],
            ))
            .unwrap()
            .build()
            .unwrap();
        let codec = BinaryValueCodec::with_registry(registry);

        let ok = Value::Record(Record::new(
            employee.clone(),
            vec![("Salary".to_string(), Value::Int32(5000))],
        ));
        let out = round_trip(&codec, &ok, &employee).unwrap();
        assert_eq!(Some(&Value::Int64(5000)), out.field("Salary"));

        let bad = Value::Record(Record::new(
            employee.clone(),
            vec![("Bonus".to_string(), Value::Int32(1))],
        ));
        assert!(round_trip(&codec, &bad, &employee).is_err());
    }

    #[rstest]
    #[case::whole_seconds(0)]
    #[case::micros(123_456_000)]
    #[case::nanos(123_456_789)]
    fn datetime_keeps_precision(#[case] nanos: u32) {
        let dt = NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_nano_opt(3, 4, 5, nanos)
            .unwrap();
        let codec = BinaryValueCodec::new();
        let out = round_trip(&codec, &Value::DateTime(dt), &TypeDescriptor::datetime()).unwrap();
        assert_eq!(Value::DateTime(dt), out);
    }

    #[test]
    fn pre_epoch_datetime() {
        let dt = NaiveDate::from_ymd_opt(1965, 6, 15)
            .unwrap()
            .and_hms_nano_opt(23, 59, 59, 999_999_999)
            .unwrap();
        let codec = BinaryValueCodec::new();
        let out = round_trip(&codec, &Value::DateTime(dt), &TypeDescriptor::datetime()).unwrap();
        assert_eq!(Value::DateTime(dt), out);
    }

    #[test]
    fn unknown_tag() {
        let codec = BinaryValueCodec::new();
        let mut bytes = Bytes::from_static(&[42]);
        let err = codec.decode(&mut bytes, &TypeDescriptor::int32()).unwrap_err();
        assert!(matches!(err, TypeError::Decode(_)), "{err}");
    }
}
