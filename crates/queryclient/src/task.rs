use tokio::task::JoinHandle;
use typereg::Value;

use crate::errors::{ClientError, Result};

/// Fully received result of a spawned query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Sequence(Vec<Value>),
    Scalar(Value),
}

impl QueryOutput {
    pub fn into_sequence(self) -> Option<Vec<Value>> {
        match self {
            QueryOutput::Sequence(values) => Some(values),
            QueryOutput::Scalar(_) => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            QueryOutput::Scalar(value) => Some(value),
            QueryOutput::Sequence(_) => None,
        }
    }
}

/// Handle to a query running on the tokio runtime.
///
/// The task finishes once the whole stream or scalar has been received.
#[derive(Debug)]
pub struct QueryTask {
    handle: JoinHandle<Result<QueryOutput>>,
}

impl QueryTask {
    pub(crate) fn new(handle: JoinHandle<Result<QueryOutput>>) -> Self {
        QueryTask { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the query. The connection is dropped, which the server sees as a
    /// failed write.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub async fn join(self) -> Result<QueryOutput> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ClientError::Cancelled),
            Err(e) => Err(ClientError::Internal(format!("query task failed: {e}"))),
        }
    }
}
