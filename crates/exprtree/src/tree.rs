use std::fmt;

use typereg::{TypeDescriptor, TypeRegistry, Value};

use crate::errors::{ExprError, Result};
use crate::node::{ExprId, ExprKind, ExprNode};
use crate::typing;

/// Maximum nesting depth of a tree.
pub const MAX_DEPTH: usize = 256;

/// Maximum number of node visits when walking a tree from its root. Bounds
/// the work done for trees that share subtrees heavily.
pub const MAX_EXPANDED_NODES: usize = 1 << 20;

/// A composed query: an arena of nodes and the root to evaluate.
///
/// Nodes only reference nodes with a smaller index, so a tree is acyclic by
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprTree {
    nodes: Vec<ExprNode>,
    root: ExprId,
}

impl ExprTree {
    /// Assemble a tree from raw parts, checking references.
    pub fn from_parts(nodes: Vec<ExprNode>, root: ExprId) -> Result<Self> {
        if root.index() >= nodes.len() {
            return Err(ExprError::InvalidReference {
                node: nodes.len(),
                child: root.index(),
            });
        }
        for (idx, node) in nodes.iter().enumerate() {
            for child in node.kind.children() {
                if child.index() >= idx {
                    return Err(ExprError::InvalidReference {
                        node: idx,
                        child: child.index(),
                    });
                }
            }
        }
        Ok(ExprTree { nodes, root })
    }

    pub fn root(&self) -> ExprId {
        self.root
    }

    pub fn nodes(&self) -> &[ExprNode] {
        &self.nodes
    }

    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Static type of the root.
    pub fn result_type(&self) -> &TypeDescriptor {
        &self.node(self.root).ty
    }

    /// Iterate over the names of all extension nodes in the tree.
    pub fn extension_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            ExprKind::Extension { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Check that every parameter reachable from the root is bound by an
    /// enclosing lambda that declares it with the same type.
    pub fn validate(&self) -> Result<()> {
        let mut scope = Vec::new();
        let mut visited = 0;
        self.validate_node(self.root, &mut scope, 0, &mut visited)
    }

    fn validate_node<'a>(
        &'a self,
        id: ExprId,
        scope: &mut Vec<(&'a str, &'a TypeDescriptor)>,
        depth: usize,
        visited: &mut usize,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooComplex(format!(
                "nested deeper than {MAX_DEPTH}"
            )));
        }
        *visited += 1;
        if *visited > MAX_EXPANDED_NODES {
            return Err(ExprError::TooComplex(format!(
                "expands to more than {MAX_EXPANDED_NODES} nodes"
            )));
        }

        let node = self.node(id);
        match &node.kind {
            ExprKind::Parameter { name } => {
                let bound = scope.iter().rev().find(|(n, _)| *n == name.as_str());
                match bound {
                    Some((_, ty)) if **ty == node.ty => Ok(()),
                    _ => Err(ExprError::UnboundParameter(name.clone())),
                }
            }
            ExprKind::Lambda { params, body } => {
                let mark = scope.len();
                scope.extend(params.iter().map(|(n, ty)| (n.as_str(), ty)));
                let result = self.validate_node(*body, scope, depth + 1, visited);
                scope.truncate(mark);
                result
            }
            kind => {
                for child in kind.children() {
                    self.validate_node(child, scope, depth + 1, visited)?;
                }
                Ok(())
            }
        }
    }

    /// Re-derive the type of every node against `registry` and check it
    /// against the type each node carries.
    pub fn check_types(&self, registry: &TypeRegistry) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            let actual = typing::infer_type(registry, &self.nodes[..idx], &node.kind, Some(&node.ty))?;
            if actual != node.ty {
                return Err(ExprError::TypeMismatch {
                    node: idx,
                    declared: node.ty.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        let node = self.node(id);
        match &node.kind {
            ExprKind::Source { entity } => write!(f, "source({})", entity.name),
            ExprKind::Constant(Value::String(s)) => write!(f, "{s:?}"),
            ExprKind::Constant(v) => write!(f, "{v}"),
            ExprKind::Parameter { name } => write!(f, "{name}"),
            ExprKind::Member { target, member } => {
                self.fmt_node(f, *target)?;
                write!(f, ".{member}")
            }
            ExprKind::Call { method, args } => {
                let (receiver, rest) = match args.split_first() {
                    Some((first, rest)) => (Some(*first), rest),
                    None => (None, args.as_slice()),
                };
                if let Some(receiver) = receiver {
                    self.fmt_node(f, receiver)?;
                    write!(f, ".")?;
                }
                write!(f, "{}(", method.short_name())?;
                self.fmt_list(f, rest)?;
                write!(f, ")")
            }
            ExprKind::Lambda { params, body } => {
                match params.as_slice() {
                    [(name, _)] => write!(f, "{name}")?,
                    params => {
                        write!(f, "(")?;
                        for (idx, (name, _)) in params.iter().enumerate() {
                            if idx > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{name}")?;
                        }
                        write!(f, ")")?;
                    }
                }
                write!(f, " => ")?;
                self.fmt_node(f, *body)
            }
            ExprKind::Binary { op, left, right } => {
                write!(f, "(")?;
                self.fmt_node(f, *left)?;
                write!(f, " {} ", op.symbol())?;
                self.fmt_node(f, *right)?;
                write!(f, ")")
            }
            ExprKind::Unary { op, operand } => {
                write!(f, "{}", op.symbol())?;
                self.fmt_node(f, *operand)
            }
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                write!(f, "(")?;
                self.fmt_node(f, *test)?;
                write!(f, " ? ")?;
                self.fmt_node(f, *if_true)?;
                write!(f, " : ")?;
                self.fmt_node(f, *if_false)?;
                write!(f, ")")
            }
            ExprKind::New { fields } => {
                write!(f, "new {{ ")?;
                for (idx, (name, id)) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = ")?;
                    self.fmt_node(f, *id)?;
                }
                write!(f, " }}")
            }
            ExprKind::Convert { operand } => {
                write!(f, "({})", node.ty)?;
                self.fmt_node(f, *operand)
            }
            ExprKind::Quote { operand } => self.fmt_node(f, *operand),
            ExprKind::Extension { name, args } => {
                write!(f, "{name}(")?;
                self.fmt_list(f, args)?;
                write!(f, ")")
            }
        }
    }

    fn fmt_list(&self, f: &mut fmt::Formatter<'_>, ids: &[ExprId]) -> fmt::Result {
        for (idx, id) in ids.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            self.fmt_node(f, *id)?;
        }
        Ok(())
    }
}

/// Compact method-chain rendering, e.g.
/// `source(Employee).Where(e => (e.Salary > 5000)).Count()`.
impl fmt::Display for ExprTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, self.root)
    }
}
