use exprproto::{ErrorCode, ProtoError};
use typereg::{ResultShape, TypeError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Proto(ProtoError),

    /// The server reported a fault for this request.
    #[error("remote execution failed ({code}): {message}")]
    RemoteExecution { code: ErrorCode, message: String },

    #[error("expected a {expected} result, declared type gives {shape}")]
    ShapeMismatch {
        expected: &'static str,
        shape: ResultShape,
    },

    #[error("connection closed before the response was complete")]
    ConnectionClosed,

    #[error("query was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

impl From<ProtoError> for ClientError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Fault(fault) => ClientError::RemoteExecution {
                code: fault.code,
                message: fault.message,
            },
            ProtoError::UnexpectedEof => ClientError::ConnectionClosed,
            ProtoError::Io(err) => ClientError::Io(err),
            ProtoError::Type(err) => ClientError::Type(err),
            other => ClientError::Proto(other),
        }
    }
}

impl ClientError {
    /// Fault code if the server rejected or failed the request.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::RemoteExecution { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use exprproto::Fault;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::unresolved(ErrorCode::UnresolvedType)]
    #[case::source(ErrorCode::SourceExecution)]
    #[case::protocol(ErrorCode::Protocol)]
    fn fault_becomes_remote_execution(#[case] code: ErrorCode) {
        let err = ClientError::from(ProtoError::Fault(Fault::new(code, "failed")));
        assert_eq!(Some(code), err.remote_code());
    }

    #[test]
    fn early_eof_is_connection_closed() {
        assert!(matches!(
            ClientError::from(ProtoError::UnexpectedEof),
            ClientError::ConnectionClosed
        ));
        assert_eq!(None, ClientError::ConnectionClosed.remote_code());
    }
}
