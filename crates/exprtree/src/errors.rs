use typereg::{TypeDescriptor, TypeError};

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("type {owner} has no member '{member}'")]
    UnknownMember {
        owner: TypeDescriptor,
        member: String,
    },

    #[error("parameter '{0}' is not bound by an enclosing lambda")]
    UnboundParameter(String),

    #[error("expected a sequence, got {0}")]
    NotASequence(TypeDescriptor),

    #[error("{0} requires an ordered source")]
    NotOrdered(&'static str),

    #[error("{method} takes {expected} arguments, got {got}")]
    ArgumentCount {
        method: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("node {node} references node {child} which does not precede it")]
    InvalidReference { node: usize, child: usize },

    #[error("node {node} declares type {declared} but its expression has type {actual}")]
    TypeMismatch {
        node: usize,
        declared: TypeDescriptor,
        actual: TypeDescriptor,
    },

    #[error("expression tree exceeds limits: {0}")]
    TooComplex(String),
}

pub type Result<T, E = ExprError> = std::result::Result<T, E>;
