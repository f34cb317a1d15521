use std::io;

use exprtree::ExprError;
use typereg::TypeError;

use crate::fault::Fault;

pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("cannot encode: {0}")]
    Encode(String),

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame type: {}", *.0 as char)]
    InvalidFrameType(u8),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("remote fault: {0}")]
    Fault(Fault),

    #[error("connection closed before the response completed")]
    UnexpectedEof,

    #[error(transparent)]
    Io(#[from] io::Error),
}
