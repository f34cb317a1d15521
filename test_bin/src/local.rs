use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use queryclient::{Connector, Transport};
use queryexec::DataSource;
use querysrv::{RemoteQueryHandler, RetrieveOutcome};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default size of the in memory pipe between client and handler.
pub const DEFAULT_PIPE_SIZE: usize = 8 * 1024;

/// Connects a client to a handler in the same process.
///
/// Every connection is served on its own task. The handler is shared behind
/// a mutex, so requests are executed one after another. `connect` waits for
/// the handler before returning, so a query issued while an earlier result
/// stream is still undrained never starts. Drain or drop the stream first.
pub struct LocalConnector<S: DataSource + 'static> {
    handler: Arc<Mutex<RemoteQueryHandler<S>>>,
    outcomes: Arc<Mutex<Vec<RetrieveOutcome>>>,
    pipe_size: usize,
}

impl<S: DataSource + 'static> LocalConnector<S> {
    pub fn new(handler: RemoteQueryHandler<S>) -> Self {
        LocalConnector {
            handler: Arc::new(Mutex::new(handler)),
            outcomes: Arc::new(Mutex::new(Vec::new())),
            pipe_size: DEFAULT_PIPE_SIZE,
        }
    }

    pub fn with_pipe_size(mut self, pipe_size: usize) -> Self {
        self.pipe_size = pipe_size;
        self
    }

    /// Wait for every request handed to the handler so far to finish.
    pub async fn settle(&self) {
        let _handler = self.handler.lock().await;
    }

    /// Outcomes of all finished requests, oldest first.
    pub async fn outcomes(&self) -> Vec<RetrieveOutcome> {
        self.settle().await;
        self.outcomes.lock().await.clone()
    }
}

impl<S: DataSource + 'static> fmt::Debug for LocalConnector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalConnector")
            .field("pipe_size", &self.pipe_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: DataSource + 'static> Connector for LocalConnector<S> {
    async fn connect(&self) -> queryclient::Result<Box<dyn Transport>> {
        let (client, server) = tokio::io::duplex(self.pipe_size);
        let handler = self.handler.clone();
        let outcomes = self.outcomes.clone();

        // Take the lock before returning so requests are served in the
        // order they connected.
        let mut handler = handler.lock_owned().await;
        tokio::spawn(async move {
            match handler.handle_connection(server).await {
                Ok(outcome) => outcomes.lock().await.push(outcome),
                Err(e) => warn!(%e, "local connection failed"),
            }
        });

        Ok(Box::new(client))
    }
}

/// Serve `handler` over TCP on an ephemeral local port.
///
/// Connections are accepted until the runtime shuts down.
pub async fn serve_tcp<S: DataSource + 'static>(
    handler: RemoteQueryHandler<S>,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handler = Arc::new(Mutex::new(handler));

    tokio::spawn(async move {
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(%e, "failed to accept connection");
                    continue;
                }
            };
            debug!(%peer, "accepted connection");
            let mut handler = handler.clone().lock_owned().await;
            tokio::spawn(async move {
                if let Err(e) = handler.handle_connection(conn).await {
                    warn!(%e, %peer, "connection failed");
                }
            });
        }
    });

    Ok(addr)
}
