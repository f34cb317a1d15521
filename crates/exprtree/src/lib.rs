//! Expression trees describing a composed query.
//!
//! A tree is pure data: source references, constants, lambdas, operator calls
//! and so on, each node carrying the descriptor of the value it produces.
//! Trees are built on the client with [`TreeBuilder`] and executed on the
//! server after being shipped across the wire.

pub mod builder;
pub mod errors;
pub mod node;
pub mod tree;
pub mod typing;

pub use builder::TreeBuilder;
pub use errors::{ExprError, Result};
pub use node::{BinaryOp, ExprId, ExprKind, ExprNode, Method, UnaryOp};
pub use tree::ExprTree;
