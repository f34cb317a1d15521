use std::fmt;

/// Names of types every process understands without registration.
pub mod names {
    pub const BOOL: &str = "bool";
    pub const INT32: &str = "int32";
    pub const INT64: &str = "int64";
    pub const FLOAT64: &str = "float64";
    pub const STRING: &str = "string";
    pub const DATETIME: &str = "datetime";

    pub const SEQUENCE: &str = "sequence";
    pub const LIST: &str = "list";
    pub const GROUPING: &str = "grouping";
    pub const DICTIONARY: &str = "dictionary";
    pub const FUNCTION: &str = "func";
    pub const ANONYMOUS: &str = "anonymous";

    /// Prefix of the per-field descriptors nested inside an anonymous shape.
    pub const FIELD_PREFIX: char = '.';
}

/// Structural handle for a type that can cross a process boundary.
///
/// Two descriptors identify the same type iff name, generic arguments and
/// version token are all equal. A descriptor says nothing about whether the
/// type exists locally; that's decided by a [`TypeRegistry`].
///
/// [`TypeRegistry`]: crate::registry::TypeRegistry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDescriptor {
    pub name: String,
    pub args: Vec<TypeDescriptor>,
    pub version: u32,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, args: Vec<TypeDescriptor>, version: u32) -> Self {
        TypeDescriptor {
            name: name.into(),
            args,
            version,
        }
    }

    fn builtin(name: &str) -> Self {
        TypeDescriptor::new(name, Vec::new(), 0)
    }

    pub fn bool() -> Self {
        Self::builtin(names::BOOL)
    }

    pub fn int32() -> Self {
        Self::builtin(names::INT32)
    }

    pub fn int64() -> Self {
        Self::builtin(names::INT64)
    }

    pub fn float64() -> Self {
        Self::builtin(names::FLOAT64)
    }

    pub fn string() -> Self {
        Self::builtin(names::STRING)
    }

    pub fn datetime() -> Self {
        Self::builtin(names::DATETIME)
    }

    /// Descriptor of a registered entity.
    pub fn entity(name: impl Into<String>, version: u32) -> Self {
        TypeDescriptor::new(name, Vec::new(), version)
    }

    /// A lazily produced sequence of `element`. This is the only shape that
    /// gets streamed back to a client.
    pub fn sequence(element: TypeDescriptor) -> Self {
        TypeDescriptor::new(names::SEQUENCE, vec![element], 0)
    }

    /// A materialized collection.
    pub fn list(element: TypeDescriptor) -> Self {
        TypeDescriptor::new(names::LIST, vec![element], 0)
    }

    pub fn grouping(key: TypeDescriptor, element: TypeDescriptor) -> Self {
        TypeDescriptor::new(names::GROUPING, vec![key, element], 0)
    }

    pub fn dictionary(key: TypeDescriptor, value: TypeDescriptor) -> Self {
        TypeDescriptor::new(names::DICTIONARY, vec![key, value], 0)
    }

    /// Type of a lambda. The last argument is the return type.
    pub fn function(params: impl IntoIterator<Item = TypeDescriptor>, ret: TypeDescriptor) -> Self {
        let mut args: Vec<_> = params.into_iter().collect();
        args.push(ret);
        TypeDescriptor::new(names::FUNCTION, args, 0)
    }

    /// Structural shape with ordered, named fields and no nominal identity.
    pub fn anonymous<'a>(fields: impl IntoIterator<Item = (&'a str, TypeDescriptor)>) -> Self {
        let args = fields
            .into_iter()
            .map(|(name, ty)| {
                TypeDescriptor::new(format!("{}{name}", names::FIELD_PREFIX), vec![ty], 0)
            })
            .collect();
        TypeDescriptor::new(names::ANONYMOUS, args, 0)
    }

    pub fn is_builtin_primitive(&self) -> bool {
        self.args.is_empty()
            && matches!(
                self.name.as_str(),
                names::BOOL
                    | names::INT32
                    | names::INT64
                    | names::FLOAT64
                    | names::STRING
                    | names::DATETIME
            )
    }

    pub fn is_numeric(&self) -> bool {
        self.args.is_empty()
            && matches!(
                self.name.as_str(),
                names::INT32 | names::INT64 | names::FLOAT64
            )
    }

    /// Element type if this is a `sequence<E>`.
    pub fn sequence_element(&self) -> Option<&TypeDescriptor> {
        match (self.name.as_str(), self.args.as_slice()) {
            (names::SEQUENCE, [element]) => Some(element),
            _ => None,
        }
    }

    /// Element type of anything that can be enumerated: sequences, lists and
    /// groupings.
    pub fn enumerable_element(&self) -> Option<&TypeDescriptor> {
        match (self.name.as_str(), self.args.as_slice()) {
            (names::SEQUENCE, [element]) | (names::LIST, [element]) => Some(element),
            (names::GROUPING, [_, element]) => Some(element),
            _ => None,
        }
    }

    /// Key type if this is a `grouping<K, E>`.
    pub fn grouping_key(&self) -> Option<&TypeDescriptor> {
        match (self.name.as_str(), self.args.as_slice()) {
            (names::GROUPING, [key, _]) => Some(key),
            _ => None,
        }
    }

    /// Parameter and return types if this is a function type.
    pub fn function_signature(&self) -> Option<(&[TypeDescriptor], &TypeDescriptor)> {
        if self.name != names::FUNCTION {
            return None;
        }
        let (ret, params) = self.args.split_last()?;
        Some((params, ret))
    }

    /// Field names and types if this is an anonymous shape.
    pub fn anonymous_fields(&self) -> Option<Vec<(&str, &TypeDescriptor)>> {
        if self.name != names::ANONYMOUS {
            return None;
        }
        self.args
            .iter()
            .map(|field| {
                let name = field.name.strip_prefix(names::FIELD_PREFIX)?;
                match field.args.as_slice() {
                    [ty] => Some((name, ty)),
                    _ => None,
                }
            })
            .collect()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(fields) = self.anonymous_fields() {
            write!(f, "{{")?;
            for (idx, (name, ty)) in fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}: {ty}")?;
            }
            return write!(f, "}}");
        }

        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "<")?;
            for (idx, arg) in self.args.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        if self.version != 0 {
            write!(f, "@v{}", self.version)?;
        }
        Ok(())
    }
}
