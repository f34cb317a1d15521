//! Client side of remote queries.
//!
//! A [`RemoteQueryProvider`] ships an expression tree to a server and hands
//! back either a lazily decoded [`ResultStream`] or a single value.

pub mod config;
pub mod connector;
pub mod errors;
pub mod provider;
pub mod stream;
pub mod task;

pub use config::{ProviderConfig, ProviderConfigBuilder};
pub use connector::{Connector, TcpConnector, Transport};
pub use errors::{ClientError, Result};
pub use provider::{QueryResult, RemoteQueryProvider};
pub use stream::ResultStream;
pub use task::{QueryOutput, QueryTask};
