use exprtree::ExprTree;
use tracing::trace;
use typereg::{ResultShape, TypeDescriptor, TypeRegistry};

use crate::errors::{ExecError, Result};

/// A received tree checked against the local type registry and the declared
/// result type.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    tree: ExprTree,
    declared: TypeDescriptor,
    shape: ResultShape,
}

impl BoundQuery {
    /// Bind a tree for execution.
    ///
    /// Every type the tree mentions must resolve locally. No substitution is
    /// attempted for unknown or mismatched types.
    pub fn bind(tree: ExprTree, declared: TypeDescriptor, registry: &TypeRegistry) -> Result<Self> {
        registry.resolve(&declared)?;
        for node in tree.nodes() {
            registry.resolve(&node.ty)?;
        }

        tree.validate()?;
        tree.check_types(registry)?;

        let actual = tree.result_type();
        if *actual != declared {
            return Err(ExecError::ResultTypeMismatch {
                declared,
                actual: actual.clone(),
            });
        }

        let shape = ResultShape::classify(registry, &declared)?;
        trace!(%shape, "bound query");

        Ok(BoundQuery {
            tree,
            declared,
            shape,
        })
    }

    pub fn tree(&self) -> &ExprTree {
        &self.tree
    }

    pub fn declared(&self) -> &TypeDescriptor {
        &self.declared
    }

    pub fn shape(&self) -> &ResultShape {
        &self.shape
    }
}
