use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use exprproto::{ClientCodec, ElementStream};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio_util::codec::Framed;
use tracing::trace;
use typereg::{FromValue, TypeDescriptor, Value};

use crate::connector::Transport;
use crate::errors::{ClientError, Result};

pub(crate) type ResponseFrames = Framed<Box<dyn Transport>, ClientCodec>;

/// Forward only stream of query results.
///
/// Elements are decoded one per poll in the order the server produced them.
/// The connection is released when the stream reaches the end, yields an
/// error, or is dropped, whichever happens first.
pub struct ResultStream {
    inner: ElementStream<ResponseFrames>,
}

impl ResultStream {
    pub(crate) fn new(inner: ElementStream<ResponseFrames>) -> Self {
        ResultStream { inner }
    }

    pub fn element_type(&self) -> &TypeDescriptor {
        self.inner.element_type()
    }

    /// Number of elements yielded so far.
    pub fn received(&self) -> u64 {
        self.inner.received()
    }

    /// Whether the connection has already been released.
    pub fn is_released(&self) -> bool {
        self.inner.is_finished()
    }

    /// Drain the stream.
    pub async fn collect_values(self) -> Result<Vec<Value>> {
        self.try_collect().await
    }

    /// Drain the stream, converting every element.
    pub async fn collect_as<T: FromValue>(self) -> Result<Vec<T>> {
        let values = self.collect_values().await?;
        values
            .into_iter()
            .map(|value| T::from_value(value).map_err(ClientError::from))
            .collect()
    }
}

impl Stream for ResultStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|item| item.map(|result| result.map_err(ClientError::from)))
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if !self.inner.is_finished() {
            trace!(
                received = self.inner.received(),
                "result stream dropped early, closing connection"
            );
        }
    }
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("element_type", self.inner.element_type())
            .field("received", &self.inner.received())
            .field("released", &self.inner.is_finished())
            .finish()
    }
}
