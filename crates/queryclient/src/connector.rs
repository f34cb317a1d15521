use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::errors::Result;

/// Byte stream carrying one request and its response.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Opens a fresh transport for every query.
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpConnector { addr: addr.into() }
    }

    async fn connect_to(addr: impl ToSocketAddrs) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        debug!(addr = %self.addr, "connecting");
        let stream = Self::connect_to(self.addr.as_str()).await?;
        Ok(Box::new(stream))
    }
}
