//! Server side query execution.
//!
//! A received tree is bound against the local type registry, then evaluated
//! against a [`DataSource`] inside a [`Session`].

pub mod bind;
pub mod errors;
pub mod eval;
pub mod extension;
pub mod scalar;
pub mod session;
pub mod source;

pub use bind::BoundQuery;
pub use errors::{ExecError, Result};
pub use eval::{Evaluated, Evaluator};
pub use extension::{ExtensionRegistry, ScalarExtension};
pub use session::{Session, SessionState};
pub use source::{DataSource, MemoryDataSource, RowIter, SessionCounters};
