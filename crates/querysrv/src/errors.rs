use exprproto::{ErrorCode, Fault, ProtoError};
use queryexec::ExecError;

#[derive(Debug, thiserror::Error)]
pub enum SrvError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("connection closed before a request was received")]
    NoRequest,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SrvError> = std::result::Result<T, E>;

impl From<&SrvError> for Fault {
    fn from(err: &SrvError) -> Self {
        match err {
            SrvError::Proto(err) => err.into(),
            SrvError::Exec(err) => err.into(),
            SrvError::NoRequest => Fault::new(ErrorCode::Protocol, err.to_string()),
            SrvError::Io(_) => Fault::new(ErrorCode::Internal, err.to_string()),
        }
    }
}
