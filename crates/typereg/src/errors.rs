use crate::descriptor::TypeDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("unresolved type {descriptor}: {reason}")]
    UnresolvedType {
        descriptor: TypeDescriptor,
        reason: String,
    },

    #[error("type '{0}' registered more than once")]
    DuplicateRegistration(String),

    #[error("invalid type descriptor {0}")]
    InvalidDescriptor(TypeDescriptor),

    #[error("value of kind {kind} is not compatible with {expected}")]
    Incompatible {
        kind: &'static str,
        expected: TypeDescriptor,
    },

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl TypeError {
    pub fn unresolved(descriptor: &TypeDescriptor, reason: impl Into<String>) -> Self {
        TypeError::UnresolvedType {
            descriptor: descriptor.clone(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = TypeError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::TypeError::Internal(std::format!($($arg)*))
    };
}
#[allow(unused_imports)]
pub(crate) use internal;
