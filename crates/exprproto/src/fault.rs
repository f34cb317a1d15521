use std::fmt;

use exprtree::ExprError;
use typereg::TypeError;

use crate::errors::ProtoError;

/// Category of a failed request, sent to the client in a [`Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// A type in the request has no matching local definition.
    UnresolvedType = 1,
    /// The request uses a node kind or operation the server can't handle.
    UnsupportedOperation = 2,
    /// The data source or evaluation failed.
    SourceExecution = 3,
    /// Session used out of order. Indicates a server bug.
    SessionState = 4,
    /// Malformed request.
    Protocol = 5,
    Internal = 6,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnresolvedType => "UNRESOLVED_TYPE",
            ErrorCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorCode::SourceExecution => "SOURCE_EXECUTION",
            ErrorCode::SessionState => "SESSION_STATE",
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::UnresolvedType,
            2 => ErrorCode::UnsupportedOperation,
            3 => ErrorCode::SourceExecution,
            4 => ErrorCode::SessionState,
            5 => ErrorCode::Protocol,
            6 => ErrorCode::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: ErrorCode,
    pub message: String,
}

impl Fault {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Fault {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&TypeError> for Fault {
    fn from(err: &TypeError) -> Self {
        let code = match err {
            TypeError::UnresolvedType { .. } => ErrorCode::UnresolvedType,
            TypeError::Internal(_) => ErrorCode::Internal,
            _ => ErrorCode::Protocol,
        };
        Fault::new(code, err.to_string())
    }
}

impl From<&ExprError> for Fault {
    fn from(err: &ExprError) -> Self {
        match err {
            ExprError::Type(err) => err.into(),
            other => Fault::new(ErrorCode::Protocol, other.to_string()),
        }
    }
}

impl From<&ProtoError> for Fault {
    fn from(err: &ProtoError) -> Self {
        match err {
            ProtoError::Type(err) => err.into(),
            ProtoError::Expr(err) => err.into(),
            ProtoError::UnsupportedOperation(_) => {
                Fault::new(ErrorCode::UnsupportedOperation, err.to_string())
            }
            ProtoError::Fault(fault) => fault.clone(),
            ProtoError::Io(_) | ProtoError::UnexpectedEof => {
                Fault::new(ErrorCode::Internal, err.to_string())
            }
            _ => Fault::new(ErrorCode::Protocol, err.to_string()),
        }
    }
}
