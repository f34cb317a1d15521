//! Server side of remote queries: reads one request per connection, executes
//! it against a data source and streams the result back.

pub mod config;
pub mod errors;
pub mod handler;
pub mod state;

pub use config::{HandlerConfig, HandlerConfigBuilder};
pub use errors::{Result, SrvError};
pub use handler::{RemoteQueryHandler, RetrieveOutcome};
pub use state::HandlerState;
