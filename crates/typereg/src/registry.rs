use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{TypeDescriptor, names};
use crate::errors::{Result, TypeError};

/// A member of a registered entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSchema {
    pub name: String,
    pub ty: TypeDescriptor,
}

impl MemberSchema {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        MemberSchema {
            name: name.into(),
            ty,
        }
    }
}

/// Schema of an entity the embedding application exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    pub descriptor: TypeDescriptor,
    pub members: Vec<MemberSchema>,
}

impl EntitySchema {
    pub fn new(descriptor: TypeDescriptor, members: Vec<MemberSchema>) -> Self {
        EntitySchema {
            descriptor,
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn member(&self, name: &str) -> Option<&MemberSchema> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// A descriptor that has been matched against local definitions.
///
/// Entities resolve to their schema without resolving member types, member
/// types are resolved on demand. This keeps resolution finite for schemas that
/// reference each other.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    DateTime,
    Entity(Arc<EntitySchema>),
    Sequence(Box<ResolvedType>),
    List(Box<ResolvedType>),
    Grouping {
        key: Box<ResolvedType>,
        element: Box<ResolvedType>,
    },
    Dictionary {
        key: Box<ResolvedType>,
        value: Box<ResolvedType>,
    },
    Function {
        params: Vec<ResolvedType>,
        ret: Box<ResolvedType>,
    },
    Anonymous(Vec<(String, ResolvedType)>),
}

impl ResolvedType {
    pub fn is_sequence(&self) -> bool {
        matches!(self, ResolvedType::Sequence(_))
    }
}

/// Builds a [`TypeRegistry`].
///
/// Registration happens once during startup. Once built, the registry is
/// immutable and shared by reference.
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    entities: HashMap<String, Arc<EntitySchema>>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, schema: EntitySchema) -> Result<Self> {
        let desc = &schema.descriptor;
        if !desc.args.is_empty() || is_reserved_name(&desc.name) {
            return Err(TypeError::InvalidDescriptor(desc.clone()));
        }
        if self.entities.contains_key(&desc.name) {
            return Err(TypeError::DuplicateRegistration(desc.name.clone()));
        }
        self.entities
            .insert(desc.name.clone(), Arc::new(schema));
        Ok(self)
    }

    /// Finish registration, checking that every member of every entity
    /// resolves.
    pub fn build(self) -> Result<Arc<TypeRegistry>> {
        let registry = TypeRegistry {
            entities: self.entities,
        };

        for schema in registry.entities.values() {
            for member in &schema.members {
                registry.resolve(&member.ty).map_err(|e| {
                    TypeError::unresolved(
                        &member.ty,
                        format!(
                            "member '{}' of '{}' does not resolve: {e}",
                            member.name,
                            schema.name()
                        ),
                    )
                })?;
            }
        }

        debug!(entities = registry.entities.len(), "built type registry");

        Ok(Arc::new(registry))
    }
}

/// Local schema table used to resolve descriptors received from (or sent to)
/// another process.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entities: HashMap<String, Arc<EntitySchema>>,
}

impl TypeRegistry {
    /// A registry with no entities. Only builtin types resolve.
    pub fn empty() -> Arc<Self> {
        Arc::new(TypeRegistry::default())
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntitySchema>> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }

    /// Resolve a descriptor to a local type.
    ///
    /// Never substitutes: an unknown entity, or a known entity whose version
    /// token differs from the local one, fails with `UnresolvedType`.
    pub fn resolve(&self, desc: &TypeDescriptor) -> Result<ResolvedType> {
        let args = desc.args.as_slice();
        let resolved = match (desc.name.as_str(), args) {
            (names::BOOL, []) => ResolvedType::Bool,
            (names::INT32, []) => ResolvedType::Int32,
            (names::INT64, []) => ResolvedType::Int64,
            (names::FLOAT64, []) => ResolvedType::Float64,
            (names::STRING, []) => ResolvedType::String,
            (names::DATETIME, []) => ResolvedType::DateTime,
            (names::SEQUENCE, [element]) => ResolvedType::Sequence(Box::new(self.resolve(element)?)),
            (names::LIST, [element]) => ResolvedType::List(Box::new(self.resolve(element)?)),
            (names::GROUPING, [key, element]) => ResolvedType::Grouping {
                key: Box::new(self.resolve(key)?),
                element: Box::new(self.resolve(element)?),
            },
            (names::DICTIONARY, [key, value]) => ResolvedType::Dictionary {
                key: Box::new(self.resolve(key)?),
                value: Box::new(self.resolve(value)?),
            },
            (names::FUNCTION, [params @ .., ret]) => ResolvedType::Function {
                params: params
                    .iter()
                    .map(|p| self.resolve(p))
                    .collect::<Result<Vec<_>>>()?,
                ret: Box::new(self.resolve(ret)?),
            },
            (names::ANONYMOUS, _) => {
                let fields = desc
                    .anonymous_fields()
                    .ok_or_else(|| TypeError::InvalidDescriptor(desc.clone()))?;
                let fields = fields
                    .into_iter()
                    .map(|(name, ty)| Ok((name.to_string(), self.resolve(ty)?)))
                    .collect::<Result<Vec<_>>>()?;
                ResolvedType::Anonymous(fields)
            }
            (name, _) if is_reserved_name(name) => {
                return Err(TypeError::unresolved(desc, "wrong number of type arguments"));
            }
            (name, []) => {
                let schema = self
                    .entities
                    .get(name)
                    .ok_or_else(|| TypeError::unresolved(desc, "no local definition"))?;
                if schema.descriptor.version != desc.version {
                    return Err(TypeError::unresolved(
                        desc,
                        format!(
                            "version mismatch, local definition is v{}",
                            schema.descriptor.version
                        ),
                    ));
                }
                ResolvedType::Entity(schema.clone())
            }
            (_, _) => {
                return Err(TypeError::unresolved(
                    desc,
                    "entities cannot take type arguments",
                ));
            }
        };

        Ok(resolved)
    }

    /// Type of a member of `owner`.
    ///
    /// Entities expose their registered members, anonymous shapes their
    /// fields, and groupings their `Key`.
    pub fn member_type(&self, owner: &TypeDescriptor, member: &str) -> Result<Option<TypeDescriptor>> {
        if let Some(fields) = owner.anonymous_fields() {
            return Ok(fields
                .into_iter()
                .find(|(name, _)| *name == member)
                .map(|(_, ty)| ty.clone()));
        }
        if let Some(key) = owner.grouping_key() {
            return Ok((member == "Key").then(|| key.clone()));
        }

        match self.resolve(owner)? {
            ResolvedType::Entity(schema) => Ok(schema.member(member).map(|m| m.ty.clone())),
            _ => Ok(None),
        }
    }
}

fn is_reserved_name(name: &str) -> bool {
    matches!(
        name,
        names::BOOL
            | names::INT32
            | names::INT64
            | names::FLOAT64
            | names::STRING
            | names::DATETIME
            | names::SEQUENCE
            | names::LIST
            | names::GROUPING
            | names::DICTIONARY
            | names::FUNCTION
            | names::ANONYMOUS
    ) || name.starts_with(names::FIELD_PREFIX)
}
