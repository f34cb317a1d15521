use exprproto::{ErrorCode, Fault};
use exprtree::ExprError;
use typereg::{TypeDescriptor, TypeError};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("declared result type {declared} does not match tree result type {actual}")]
    ResultTypeMismatch {
        declared: TypeDescriptor,
        actual: TypeDescriptor,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("source execution failed: {0}")]
    SourceExecution(String),

    #[error("invalid session state: {0}")]
    SessionState(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::ExecError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;

macro_rules! source_err {
    ($($arg:tt)*) => {
        crate::errors::ExecError::SourceExecution(std::format!($($arg)*))
    };
}
pub(crate) use source_err;

impl From<&ExecError> for Fault {
    fn from(err: &ExecError) -> Self {
        match err {
            ExecError::Type(err) => err.into(),
            ExecError::Expr(err) => err.into(),
            ExecError::ResultTypeMismatch { .. } => Fault::new(ErrorCode::Protocol, err.to_string()),
            ExecError::UnsupportedOperation(_) => {
                Fault::new(ErrorCode::UnsupportedOperation, err.to_string())
            }
            ExecError::SourceExecution(_) => Fault::new(ErrorCode::SourceExecution, err.to_string()),
            ExecError::SessionState(_) => Fault::new(ErrorCode::SessionState, err.to_string()),
            ExecError::Internal(_) => Fault::new(ErrorCode::Internal, err.to_string()),
        }
    }
}
