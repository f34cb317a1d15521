//! Shared fixtures for the end to end tests.
//!
//! Both halves of a remote query run in the test process: a
//! [`RemoteQueryHandler`] over the company data set, and a
//! [`RemoteQueryProvider`] connected to it through an in memory pipe.

pub mod company;
pub mod local;

use std::sync::Arc;

use exprproto::ExtensionNames;
use exprtree::TreeBuilder;
use queryclient::RemoteQueryProvider;
use queryexec::{ExecError, ExtensionRegistry, MemoryDataSource, ScalarExtension, SessionCounters};
use querysrv::{HandlerConfig, RemoteQueryHandler, RetrieveOutcome};
use typereg::{TypeRegistry, Value};

pub use local::{DEFAULT_PIPE_SIZE, LocalConnector, serve_tcp};

/// Upper cases a string and appends an exclamation mark.
#[derive(Debug)]
pub struct Shout;

impl Shout {
    pub const NAME: &str = "Shout";
}

impl ScalarExtension for Shout {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn invoke(&self, args: &[Value]) -> queryexec::Result<Value> {
        match args {
            [Value::String(s)] => Ok(Value::String(format!("{}!", s.to_uppercase()))),
            [Value::Null] => Ok(Value::Null),
            _ => Err(ExecError::SourceExecution(format!(
                "{} takes a single string",
                Self::NAME
            ))),
        }
    }
}

/// Client and handler wired together over the company data set.
#[derive(Debug)]
pub struct CompanyHarness {
    pub provider: RemoteQueryProvider,
    pub connector: Arc<LocalConnector<MemoryDataSource>>,
    pub counters: Arc<SessionCounters>,
    pub client_registry: Arc<TypeRegistry>,
}

impl CompanyHarness {
    pub fn new() -> typereg::Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> CompanyHarnessBuilder {
        CompanyHarnessBuilder::default()
    }

    /// Tree builder typed against the client's registry.
    pub fn tree(&self) -> TreeBuilder {
        TreeBuilder::new(self.client_registry.clone())
    }

    pub async fn outcomes(&self) -> Vec<RetrieveOutcome> {
        self.connector.outcomes().await
    }

    pub async fn settle(&self) {
        self.connector.settle().await
    }
}

#[derive(Debug, Default)]
pub struct CompanyHarnessBuilder {
    source: Option<MemoryDataSource>,
    client_registry: Option<Arc<TypeRegistry>>,
    pipe_size: Option<usize>,
    client_extensions: bool,
}

impl CompanyHarnessBuilder {
    /// Replace the data source the handler executes against.
    pub fn with_source(mut self, source: MemoryDataSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Type the client's trees with a different registry than the server's.
    pub fn with_client_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.client_registry = Some(registry);
        self
    }

    pub fn with_pipe_size(mut self, pipe_size: usize) -> Self {
        self.pipe_size = Some(pipe_size);
        self
    }

    /// Let the client encode [`Shout`] nodes. The server always knows it.
    pub fn with_client_extensions(mut self) -> Self {
        self.client_extensions = true;
        self
    }

    pub fn build(self) -> typereg::Result<CompanyHarness> {
        let server_registry = company::registry()?;
        let client_registry = match self.client_registry {
            Some(registry) => registry,
            None => server_registry.clone(),
        };

        let source = self.source.unwrap_or_else(company::data_source);
        let counters = source.counters();
        let handler = RemoteQueryHandler::new(source, server_registry)
            .with_extensions(ExtensionRegistry::new().with_extension(Arc::new(Shout)))
            .with_config(HandlerConfig::builder().with_log_trees(true).build());

        let connector = Arc::new(
            LocalConnector::new(handler).with_pipe_size(self.pipe_size.unwrap_or(DEFAULT_PIPE_SIZE)),
        );

        let mut provider = RemoteQueryProvider::new(connector.clone(), client_registry.clone());
        if self.client_extensions {
            provider = provider.with_extensions(ExtensionNames::from_iter([Shout::NAME]));
        }

        Ok(CompanyHarness {
            provider,
            connector,
            counters,
            client_registry,
        })
    }
}
