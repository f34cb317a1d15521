use std::fmt;

use crate::descriptor::TypeDescriptor;
use crate::errors::Result;
use crate::registry::{ResolvedType, TypeRegistry};

/// Declared cardinality of a query result.
///
/// Decided purely from the declared result type, before any response bytes
/// exist. Client and server both go through [`ResultShape::classify`] so they
/// always agree on how the response is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultShape {
    /// Zero or more elements, streamed one at a time.
    Stream { element: TypeDescriptor },
    /// Exactly one value.
    Scalar { ty: TypeDescriptor },
}

impl ResultShape {
    /// Resolve the declared type and classify it.
    pub fn classify(registry: &TypeRegistry, declared: &TypeDescriptor) -> Result<Self> {
        let resolved = registry.resolve(declared)?;
        Ok(Self::from_resolved(declared, &resolved))
    }

    /// Classify an already resolved type.
    pub fn from_resolved(declared: &TypeDescriptor, resolved: &ResolvedType) -> Self {
        match (resolved, declared.sequence_element()) {
            (ResolvedType::Sequence(_), Some(element)) => ResultShape::Stream {
                element: element.clone(),
            },
            _ => ResultShape::Scalar {
                ty: declared.clone(),
            },
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ResultShape::Stream { .. })
    }

    /// Type of each encoded element in the response body.
    pub fn element_type(&self) -> &TypeDescriptor {
        match self {
            ResultShape::Stream { element } => element,
            ResultShape::Scalar { ty } => ty,
        }
    }
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultShape::Stream { element } => write!(f, "stream of {element}"),
            ResultShape::Scalar { ty } => write!(f, "scalar {ty}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::registry::{EntitySchema, MemberSchema, TypeRegistryBuilder};

    fn employee() -> TypeDescriptor {
        TypeDescriptor::entity("Employee", 1)
    }

    #[rstest]
    #[case::entity_sequence(TypeDescriptor::sequence(employee()), true)]
    #[case::projected_sequence(TypeDescriptor::sequence(TypeDescriptor::string()), true)]
    #[case::anonymous_sequence(
        TypeDescriptor::sequence(TypeDescriptor::anonymous([("Id", TypeDescriptor::int32())])),
        true
    )]
    #[case::count(TypeDescriptor::int32(), false)]
    #[case::any(TypeDescriptor::bool(), false)]
    #[case::single_entity(employee(), false)]
    #[case::materialized_list(TypeDescriptor::list(employee()), false)]
    #[case::dictionary(TypeDescriptor::dictionary(TypeDescriptor::int32(), employee()), false)]
    fn classify(#[case] declared: TypeDescriptor, #[case] stream: bool) {
        let registry = TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                employee(),
                vec![MemberSchema::new("Id", TypeDescriptor::int32())],
            ))
            .unwrap()
            .build()
            .unwrap();

        let shape = ResultShape::classify(&registry, &declared).unwrap();
        assert_eq!(stream, shape.is_stream(), "{shape}");

        // Classifying again gives the same answer.
        assert_eq!(shape, ResultShape::classify(&registry, &declared).unwrap());
    }

    #[test]
    fn unresolved_declared_type() {
        let registry = TypeRegistry::empty();
        assert!(ResultShape::classify(&registry, &TypeDescriptor::sequence(employee())).is_err());
    }
}
