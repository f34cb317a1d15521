//! Wire format for remote queries.
//!
//! Covers the expression tree codec, the request envelope, response framing
//! and the helpers used to write and read response bodies.

pub mod errors;
pub mod fault;
pub mod frame;
pub mod result;
pub mod tree_codec;

pub use errors::{ProtoError, Result};
pub use fault::{ErrorCode, Fault};
pub use frame::{
    ClientCodec, DEFAULT_MAX_FRAME_SIZE, RequestEnvelope, RequestFrame, ResponseFrame,
    ServerCodec,
};
pub use result::{
    ElementStream, ResultEncoder, SequenceError, read_scalar, write_encoded_scalar, write_fault,
};
pub use tree_codec::{ExtensionNames, TreeDecoder, TreeEncoder};
