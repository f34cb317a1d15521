//! Type identity, object values and the object value codec.
//!
//! Everything in here is shared by both ends of a remote query: the client
//! uses it to type the trees it builds and to decode results, the server uses
//! it to rebind trees to its own schema and to encode results.

pub mod codec;
pub mod convert;
pub mod descriptor;
pub mod errors;
pub mod registry;
pub mod shape;
pub mod value;
pub mod wire;

pub use codec::{BinaryValueCodec, ValueCodec};
pub use convert::FromValue;
pub use descriptor::TypeDescriptor;
pub use errors::{Result, TypeError};
pub use registry::{EntitySchema, MemberSchema, ResolvedType, TypeRegistry, TypeRegistryBuilder};
pub use shape::ResultShape;
pub use value::{Grouping, Record, Value};
