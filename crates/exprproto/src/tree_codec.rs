use std::collections::HashSet;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use exprtree::{BinaryOp, ExprId, ExprKind, ExprNode, ExprTree, Method, UnaryOp};
use tracing::trace;
use typereg::{BinaryValueCodec, ValueCodec, wire};

use crate::errors::{ProtoError, Result};

pub const MAGIC: &[u8; 4] = b"QXPR";
pub const FORMAT_VERSION: u16 = 1;

mod tag {
    pub const SOURCE: u8 = 0;
    pub const CONSTANT: u8 = 1;
    pub const PARAMETER: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const CALL: u8 = 4;
    pub const LAMBDA: u8 = 5;
    pub const BINARY: u8 = 6;
    pub const UNARY: u8 = 7;
    pub const CONDITIONAL: u8 = 8;
    pub const NEW: u8 = 9;
    pub const CONVERT: u8 = 10;
    pub const QUOTE: u8 = 11;
    pub const EXTENSION: u8 = 12;
}

/// Names of extension node kinds a codec accepts.
#[derive(Debug, Clone, Default)]
pub struct ExtensionNames {
    names: HashSet<String>,
}

impl ExtensionNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn check(&self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(ProtoError::UnsupportedOperation(format!(
                "extension node '{name}' is not registered with the codec"
            )));
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<S> for ExtensionNames {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        ExtensionNames {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Serializes expression trees.
///
/// Layout: magic, format version, node count, root index, then every node in
/// arena order as kind tag, type descriptor and kind specific payload.
#[derive(Debug, Clone)]
pub struct TreeEncoder {
    codec: Arc<dyn ValueCodec>,
    extensions: ExtensionNames,
}

impl Default for TreeEncoder {
    fn default() -> Self {
        Self::new(Arc::new(BinaryValueCodec::new()))
    }
}

impl TreeEncoder {
    pub fn new(codec: Arc<dyn ValueCodec>) -> Self {
        TreeEncoder {
            codec,
            extensions: ExtensionNames::new(),
        }
    }

    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.insert(name);
        self
    }

    pub fn with_extensions(mut self, names: ExtensionNames) -> Self {
        self.extensions = names;
        self
    }

    /// Encode a tree. Nothing is returned unless every node could be
    /// encoded.
    pub fn encode(&self, tree: &ExprTree) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u32(tree.len() as u32);
        buf.put_u32(tree.root().0);

        for node in tree.nodes() {
            self.encode_node(node, &mut buf)?;
        }

        trace!(nodes = tree.len(), bytes = buf.len(), "encoded expression tree");
        Ok(buf.freeze())
    }

    fn encode_node(&self, node: &ExprNode, buf: &mut BytesMut) -> Result<()> {
        let tag = match &node.kind {
            ExprKind::Source { .. } => tag::SOURCE,
            ExprKind::Constant(_) => tag::CONSTANT,
            ExprKind::Parameter { .. } => tag::PARAMETER,
            ExprKind::Member { .. } => tag::MEMBER,
            ExprKind::Call { .. } => tag::CALL,
            ExprKind::Lambda { .. } => tag::LAMBDA,
            ExprKind::Binary { .. } => tag::BINARY,
            ExprKind::Unary { .. } => tag::UNARY,
            ExprKind::Conditional { .. } => tag::CONDITIONAL,
            ExprKind::New { .. } => tag::NEW,
            ExprKind::Convert { .. } => tag::CONVERT,
            ExprKind::Quote { .. } => tag::QUOTE,
            ExprKind::Extension { name, .. } => {
                self.extensions.check(name)?;
                tag::EXTENSION
            }
        };
        buf.put_u8(tag);
        wire::put_descriptor(buf, &node.ty);

        match &node.kind {
            ExprKind::Source { entity } => wire::put_descriptor(buf, entity),
            ExprKind::Constant(value) => self.codec.encode(value, buf)?,
            ExprKind::Parameter { name } => wire::put_str(buf, name),
            ExprKind::Member { target, member } => {
                buf.put_u32(target.0);
                wire::put_str(buf, member);
            }
            ExprKind::Call { method, args } => {
                wire::put_str(buf, method.name());
                put_ids(buf, args)?;
            }
            ExprKind::Lambda { params, body } => {
                put_count(buf, params.len())?;
                for (name, ty) in params {
                    wire::put_str(buf, name);
                    wire::put_descriptor(buf, ty);
                }
                buf.put_u32(body.0);
            }
            ExprKind::Binary { op, left, right } => {
                wire::put_str(buf, op.symbol());
                buf.put_u32(left.0);
                buf.put_u32(right.0);
            }
            ExprKind::Unary { op, operand } => {
                wire::put_str(buf, op.symbol());
                buf.put_u32(operand.0);
            }
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                buf.put_u32(test.0);
                buf.put_u32(if_true.0);
                buf.put_u32(if_false.0);
            }
            ExprKind::New { fields } => {
                put_count(buf, fields.len())?;
                for (name, id) in fields {
                    wire::put_str(buf, name);
                    buf.put_u32(id.0);
                }
            }
            ExprKind::Convert { operand } | ExprKind::Quote { operand } => {
                buf.put_u32(operand.0);
            }
            ExprKind::Extension { name, args } => {
                wire::put_str(buf, name);
                put_ids(buf, args)?;
            }
        }

        Ok(())
    }
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = u16::try_from(count)
        .map_err(|_| ProtoError::Encode(format!("too many operands: {count}")))?;
    buf.put_u16(count);
    Ok(())
}

fn put_ids(buf: &mut BytesMut, ids: &[ExprId]) -> Result<()> {
    put_count(buf, ids.len())?;
    for id in ids {
        buf.put_u32(id.0);
    }
    Ok(())
}

/// Reconstructs expression trees from bytes produced by [`TreeEncoder`].
#[derive(Debug, Clone)]
pub struct TreeDecoder {
    codec: Arc<dyn ValueCodec>,
    extensions: ExtensionNames,
}

impl Default for TreeDecoder {
    fn default() -> Self {
        Self::new(Arc::new(BinaryValueCodec::new()))
    }
}

impl TreeDecoder {
    pub fn new(codec: Arc<dyn ValueCodec>) -> Self {
        TreeDecoder {
            codec,
            extensions: ExtensionNames::new(),
        }
    }

    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.insert(name);
        self
    }

    pub fn with_extensions(mut self, names: ExtensionNames) -> Self {
        self.extensions = names;
        self
    }

    pub fn decode(&self, input: &[u8]) -> Result<ExprTree> {
        let mut buf = Bytes::copy_from_slice(input);

        wire::ensure_remaining(&buf, MAGIC.len(), "magic")?;
        let magic = buf.split_to(MAGIC.len());
        if magic[..] != MAGIC[..] {
            return Err(ProtoError::Decode("not an encoded expression tree".to_string()));
        }
        let version = wire::get_u16(&mut buf, "format version")?;
        if version != FORMAT_VERSION {
            return Err(ProtoError::Decode(format!(
                "unsupported format version {version}"
            )));
        }

        let count = wire::get_u32(&mut buf, "node count")? as usize;
        let root = ExprId(wire::get_u32(&mut buf, "root index")?);

        // Every node takes at least a tag and an empty descriptor, so a count
        // that can't fit in the remaining input is rejected before
        // allocating.
        if count > buf.len() / 11 {
            return Err(ProtoError::Decode(format!(
                "node count {count} exceeds input size"
            )));
        }

        let mut nodes = Vec::with_capacity(count);
        for idx in 0..count {
            let node = self.decode_node(&mut buf, idx)?;
            nodes.push(node);
        }

        if !buf.is_empty() {
            return Err(ProtoError::Decode(format!(
                "{} trailing bytes after last node",
                buf.len()
            )));
        }

        let tree = ExprTree::from_parts(nodes, root)?;
        tree.validate()?;
        Ok(tree)
    }

    fn decode_node(&self, buf: &mut Bytes, idx: usize) -> Result<ExprNode> {
        let tag = wire::get_u8(buf, "node tag")?;
        let ty = wire::get_descriptor(buf)?;

        let kind = match tag {
            tag::SOURCE => ExprKind::Source {
                entity: wire::get_descriptor(buf)?,
            },
            tag::CONSTANT => ExprKind::Constant(self.codec.decode(buf, &ty)?),
            tag::PARAMETER => ExprKind::Parameter {
                name: wire::get_str(buf, "parameter name")?,
            },
            tag::MEMBER => ExprKind::Member {
                target: get_id(buf, idx)?,
                member: wire::get_str(buf, "member name")?,
            },
            tag::CALL => {
                let name = wire::get_str(buf, "method name")?;
                let method = Method::from_name(&name).ok_or_else(|| {
                    ProtoError::UnsupportedOperation(format!("unknown method '{name}'"))
                })?;
                ExprKind::Call {
                    method,
                    args: get_ids(buf, idx)?,
                }
            }
            tag::LAMBDA => {
                let count = wire::get_u16(buf, "lambda parameter count")?;
                let mut params = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = wire::get_str(buf, "lambda parameter name")?;
                    let ty = wire::get_descriptor(buf)?;
                    params.push((name, ty));
                }
                ExprKind::Lambda {
                    params,
                    body: get_id(buf, idx)?,
                }
            }
            tag::BINARY => {
                let symbol = wire::get_str(buf, "binary operator")?;
                let op = BinaryOp::from_symbol(&symbol).ok_or_else(|| {
                    ProtoError::UnsupportedOperation(format!("unknown binary operator '{symbol}'"))
                })?;
                ExprKind::Binary {
                    op,
                    left: get_id(buf, idx)?,
                    right: get_id(buf, idx)?,
                }
            }
            tag::UNARY => {
                let symbol = wire::get_str(buf, "unary operator")?;
                let op = UnaryOp::from_symbol(&symbol).ok_or_else(|| {
                    ProtoError::UnsupportedOperation(format!("unknown unary operator '{symbol}'"))
                })?;
                ExprKind::Unary {
                    op,
                    operand: get_id(buf, idx)?,
                }
            }
            tag::CONDITIONAL => ExprKind::Conditional {
                test: get_id(buf, idx)?,
                if_true: get_id(buf, idx)?,
                if_false: get_id(buf, idx)?,
            },
            tag::NEW => {
                let count = wire::get_u16(buf, "field count")?;
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = wire::get_str(buf, "field name")?;
                    fields.push((name, get_id(buf, idx)?));
                }
                ExprKind::New { fields }
            }
            tag::CONVERT => ExprKind::Convert {
                operand: get_id(buf, idx)?,
            },
            tag::QUOTE => ExprKind::Quote {
                operand: get_id(buf, idx)?,
            },
            tag::EXTENSION => {
                let name = wire::get_str(buf, "extension name")?;
                self.extensions.check(&name)?;
                ExprKind::Extension {
                    name,
                    args: get_ids(buf, idx)?,
                }
            }
            other => {
                return Err(ProtoError::Decode(format!(
                    "unknown node tag {other} at node {idx}"
                )));
            }
        };

        Ok(ExprNode { kind, ty })
    }
}

/// Read a node reference, which must point at an earlier node.
fn get_id(buf: &mut Bytes, idx: usize) -> Result<ExprId> {
    let child = wire::get_u32(buf, "node reference")?;
    if child as usize >= idx {
        return Err(ProtoError::Decode(format!(
            "node {idx} references node {child} which does not precede it"
        )));
    }
    Ok(ExprId(child))
}

fn get_ids(buf: &mut Bytes, idx: usize) -> Result<Vec<ExprId>> {
    let count = wire::get_u16(buf, "operand count")?;
    (0..count).map(|_| get_id(buf, idx)).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use exprtree::TreeBuilder;
    use rstest::rstest;
    use typereg::{
        EntitySchema, MemberSchema, TypeDescriptor, TypeRegistry, TypeRegistryBuilder, Value,
    };

    use super::*;

    fn employee() -> TypeDescriptor {
        TypeDescriptor::entity("Employee", 1)
    }

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                employee(),
                vec![
                    MemberSchema::new("Id", TypeDescriptor::int32()),
                    MemberSchema::new("Name", TypeDescriptor::string()),
                    MemberSchema::new("Salary", TypeDescriptor::int64()),
                    MemberSchema::new("IsMale", TypeDescriptor::bool()),
                ],
            ))
            .unwrap()
            .build()
            .unwrap()
    }

    fn hired() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_nano_opt(3, 4, 5, 123_456_789)
            .unwrap()
    }

    /// A tree that exercises every node kind.
    fn every_kind(ext: Option<&str>) -> ExprTree {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let filtered = b
            .filter(employees, |b, e| {
                let male = b.member(e, "IsMale")?;
                let female = b.not(male)?;
                let salary = b.member(e, "Salary")?;
                let limit = b.constant(5000i64)?;
                let rich = b.ge(salary, limit)?;
                b.and(female, rich)
            })
            .unwrap();
        let projected = b
            .select(filtered, |b, e| {
                let id = b.member(e, "Id")?;
                let wide = b.convert(id, TypeDescriptor::int64())?;
                let neg = b.neg(wide)?;
                let salary = b.member(e, "Salary")?;
                let positive = b.constant(true)?;
                let pick = b.conditional(positive, salary, neg)?;
                let name = b.member(e, "Name")?;
                let name = match ext {
                    Some(ext) => b.extension(ext, &[name], TypeDescriptor::string())?,
                    None => name,
                };
                let none = b.null(TypeDescriptor::string())?;
                let _unused = b.eq(name, none)?;
                let stamp = b.constant(Value::DateTime(hired()))?;
                b.new_shape(&[("Name", name), ("Pick", pick), ("Hired", stamp)])
            })
            .unwrap();
        let taken = b.take(projected, 3).unwrap();
        b.finish(taken).unwrap()
    }

    #[test]
    fn round_trip_every_kind() {
        let tree = every_kind(Some("soundex"));
        let encoder = TreeEncoder::default().with_extension("soundex");
        let decoder = TreeDecoder::default().with_extension("soundex");

        let bytes = encoder.encode(&tree).unwrap();
        let decoded = decoder.decode(&bytes).unwrap();
        assert_eq!(tree, decoded);

        // Deterministic.
        assert_eq!(bytes, encoder.encode(&decoded).unwrap());
    }

    #[test]
    fn unregistered_extension_fails_encode() {
        let tree = every_kind(Some("soundex"));
        let err = TreeEncoder::default().encode(&tree).unwrap_err();
        assert!(matches!(err, ProtoError::UnsupportedOperation(_)), "{err}");
    }

    #[test]
    fn unregistered_extension_fails_decode() {
        let tree = every_kind(Some("soundex"));
        let bytes = TreeEncoder::default()
            .with_extension("soundex")
            .encode(&tree)
            .unwrap();
        let err = TreeDecoder::default().decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtoError::UnsupportedOperation(_)), "{err}");
    }

    #[rstest]
    #[case::empty(|_| 0)]
    #[case::partial_magic(|_| 3)]
    #[case::header_only(|_| 10)]
    #[case::half(|len| len / 2)]
    #[case::last_byte_missing(|len| len - 1)]
    fn truncated_input(#[case] cut: fn(usize) -> usize) {
        let bytes = TreeEncoder::default().encode(&every_kind(None)).unwrap();
        let len = cut(bytes.len());
        assert!(
            TreeDecoder::default().decode(&bytes[..len]).is_err(),
            "decoded truncated input of {len} bytes"
        );
    }

    #[test]
    fn trailing_bytes() {
        let bytes = TreeEncoder::default().encode(&every_kind(None)).unwrap();
        let mut extended = bytes.to_vec();
        extended.push(0);
        let err = TreeDecoder::default().decode(&extended).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)), "{err}");
    }

    #[test]
    fn forward_reference() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u8(tag::QUOTE);
        wire::put_descriptor(&mut buf, &TypeDescriptor::int32());
        buf.put_u32(0);

        let err = TreeDecoder::default().decode(&buf).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)), "{err}");
    }

    #[test]
    fn unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u8(99);
        wire::put_descriptor(&mut buf, &TypeDescriptor::int32());
        buf.put_u32(0);

        let err = TreeDecoder::default().decode(&buf).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)), "{err}");
    }

    #[test]
    fn datetime_literal_keeps_nanoseconds() {
        let mut b = TreeBuilder::new(registry());
        let c = b.constant(Value::DateTime(hired())).unwrap();
        let tree = b.finish(c).unwrap();

        let bytes = TreeEncoder::default().encode(&tree).unwrap();
        let decoded = TreeDecoder::default().decode(&bytes).unwrap();
        assert_eq!(tree, decoded);
    }

    #[test]
    fn constants_use_value_codec() {
        let mut b = TreeBuilder::new(registry());
        let c = b.constant_typed(
            Value::List(vec![Value::from("a"), Value::Null]),
            TypeDescriptor::list(TypeDescriptor::string()),
        )
        .unwrap();
        let tree = b.finish(c).unwrap();
        let bytes = TreeEncoder::default().encode(&tree).unwrap();
        assert_eq!(tree, TreeDecoder::default().decode(&bytes).unwrap());
    }
}
