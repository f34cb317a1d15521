use std::sync::Arc;

use exprproto::{
    ClientCodec, ElementStream, ExtensionNames, RequestEnvelope, RequestFrame, TreeEncoder,
    read_scalar,
};
use exprtree::ExprTree;
use futures::SinkExt;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, debug_span, trace};
use typereg::{BinaryValueCodec, FromValue, ResultShape, TypeDescriptor, TypeRegistry, Value, ValueCodec};

use crate::config::ProviderConfig;
use crate::connector::Connector;
use crate::errors::{ClientError, Result};
use crate::stream::{ResponseFrames, ResultStream};
use crate::task::{QueryOutput, QueryTask};

/// Result of a remote query, framed according to the declared result type.
#[derive(Debug)]
pub enum QueryResult {
    Stream(ResultStream),
    Scalar(Value),
}

impl QueryResult {
    pub fn shape_name(&self) -> &'static str {
        match self {
            QueryResult::Stream(_) => "sequence",
            QueryResult::Scalar(_) => "scalar",
        }
    }
}

/// A tree that has been classified and encoded, ready to be sent.
#[derive(Debug)]
struct PreparedQuery {
    shape: ResultShape,
    request: RequestEnvelope,
}

/// Executes expression trees on a remote server.
///
/// Every query opens its own connection through the configured
/// [`Connector`]. Nothing is cached or retried.
#[derive(Debug, Clone)]
pub struct RemoteQueryProvider {
    connector: Arc<dyn Connector>,
    registry: Arc<TypeRegistry>,
    codec: Arc<dyn ValueCodec>,
    extensions: ExtensionNames,
    config: ProviderConfig,
}

impl RemoteQueryProvider {
    pub fn new(connector: Arc<dyn Connector>, registry: Arc<TypeRegistry>) -> Self {
        let codec = Arc::new(BinaryValueCodec::with_registry(registry.clone()));
        RemoteQueryProvider {
            connector,
            registry,
            codec,
            extensions: ExtensionNames::new(),
            config: ProviderConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Extension node kinds trees may contain.
    pub fn with_extensions(mut self, extensions: ExtensionNames) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Execute a tree, declaring its own result type.
    pub async fn execute(&self, tree: &ExprTree) -> Result<QueryResult> {
        self.execute_with_type(tree, tree.result_type().clone()).await
    }

    /// Execute a tree with an explicitly declared result type.
    ///
    /// For sequence results the first response frame is read before
    /// returning, so a fault raised before the first element surfaces here.
    pub async fn execute_with_type(
        &self,
        tree: &ExprTree,
        declared: TypeDescriptor,
    ) -> Result<QueryResult> {
        let prepared = self.prepare(tree, declared)?;
        self.run(prepared).await
    }

    /// Execute a tree that must produce a sequence.
    pub async fn execute_sequence(&self, tree: &ExprTree) -> Result<ResultStream> {
        let prepared = self.prepare(tree, tree.result_type().clone())?;
        if !prepared.shape.is_stream() {
            return Err(ClientError::ShapeMismatch {
                expected: "sequence",
                shape: prepared.shape,
            });
        }
        match self.run(prepared).await? {
            QueryResult::Stream(stream) => Ok(stream),
            other => Err(ClientError::Internal(format!(
                "sequence query produced a {} result",
                other.shape_name()
            ))),
        }
    }

    /// Execute a tree that must produce a single value.
    pub async fn execute_scalar<T: FromValue>(&self, tree: &ExprTree) -> Result<T> {
        let prepared = self.prepare(tree, tree.result_type().clone())?;
        if prepared.shape.is_stream() {
            return Err(ClientError::ShapeMismatch {
                expected: "scalar",
                shape: prepared.shape,
            });
        }
        match self.run(prepared).await? {
            QueryResult::Scalar(value) => Ok(T::from_value(value)?),
            other => Err(ClientError::Internal(format!(
                "scalar query produced a {} result",
                other.shape_name()
            ))),
        }
    }

    /// Run the whole exchange on the tokio runtime.
    ///
    /// Classification and encoding happen before this returns, so a tree that
    /// cannot be sent fails here without spawning anything.
    pub fn spawn_execute(&self, tree: &ExprTree) -> Result<QueryTask> {
        let prepared = self.prepare(tree, tree.result_type().clone())?;
        let provider = self.clone();
        let handle = tokio::spawn(async move {
            match provider.run(prepared).await? {
                QueryResult::Stream(stream) => Ok(QueryOutput::Sequence(stream.collect_values().await?)),
                QueryResult::Scalar(value) => Ok(QueryOutput::Scalar(value)),
            }
        });
        Ok(QueryTask::new(handle))
    }

    fn prepare(&self, tree: &ExprTree, declared: TypeDescriptor) -> Result<PreparedQuery> {
        let shape = ResultShape::classify(&self.registry, &declared)?;
        let encoded = TreeEncoder::new(self.codec.clone())
            .with_extensions(self.extensions.clone())
            .encode(tree)?;
        trace!(%shape, tree_bytes = encoded.len(), "prepared query");
        Ok(PreparedQuery {
            shape,
            request: RequestEnvelope::new(declared, encoded),
        })
    }

    async fn run(&self, prepared: PreparedQuery) -> Result<QueryResult> {
        let span = debug_span!("remote_query", shape = %prepared.shape);
        async move {
            let mut frames = self.send(prepared.request).await?;
            match prepared.shape {
                ResultShape::Stream { element } => {
                    let mut stream = ElementStream::new(frames, self.codec.clone(), element);
                    stream.prefetch().await?;
                    debug!(finished = stream.is_finished(), "opened result stream");
                    Ok(QueryResult::Stream(ResultStream::new(stream)))
                }
                ResultShape::Scalar { ty } => {
                    let value = read_scalar(&mut frames, self.codec.as_ref(), &ty).await?;
                    debug!("received scalar result");
                    Ok(QueryResult::Scalar(value))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send(&self, request: RequestEnvelope) -> Result<ResponseFrames> {
        let conn = self.connector.connect().await?;
        let mut framed = Framed::new(conn, ClientCodec::new(self.config.max_frame_size));
        framed.send(RequestFrame::Retrieve(request)).await?;
        Ok(framed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use exprproto::{ErrorCode, Fault, ProtoError, ResponseFrame, ResultEncoder, ServerCodec};
    use exprtree::TreeBuilder;
    use futures::{StreamExt, TryStreamExt};
    use typereg::{EntitySchema, MemberSchema, TypeRegistryBuilder};

    use super::*;
    use crate::connector::Transport;

    fn item() -> TypeDescriptor {
        TypeDescriptor::entity("Item", 1)
    }

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                item(),
                vec![MemberSchema::new("Id", TypeDescriptor::int32())],
            ))
            .unwrap()
            .build()
            .unwrap()
    }

    fn element(value: i32) -> ResponseFrame {
        let encoder = ResultEncoder::new(Arc::new(BinaryValueCodec::new()));
        ResponseFrame::Element(encoder.encode_element(&Value::Int32(value)).unwrap())
    }

    /// Plays back a fixed response for every connection.
    #[derive(Debug, Default)]
    struct ScriptedConnector {
        frames: Vec<ResponseFrame>,
        hold_open: bool,
        connects: AtomicUsize,
        requests: Arc<Mutex<Vec<RequestEnvelope>>>,
    }

    impl ScriptedConnector {
        fn new(frames: Vec<ResponseFrame>) -> Arc<Self> {
            Arc::new(ScriptedConnector {
                frames,
                ..Default::default()
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(256);
            let frames = self.frames.clone();
            let hold_open = self.hold_open;
            let requests = self.requests.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(server, ServerCodec::default());
                if let Some(Ok(RequestFrame::Retrieve(request))) = framed.next().await {
                    requests.lock().unwrap().push(request);
                }
                for frame in frames {
                    if framed.send(frame).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    std::future::pending::<()>().await;
                }
            });
            Ok(Box::new(client))
        }
    }

    fn ids_tree() -> ExprTree {
        let mut b = TreeBuilder::new(registry());
        let src = b.source(item()).unwrap();
        let ids = b.select(src, |b, e| b.member(e, "Id")).unwrap();
        b.finish(ids).unwrap()
    }

    fn count_tree() -> ExprTree {
        let mut b = TreeBuilder::new(registry());
        let src = b.source(item()).unwrap();
        let count = b.count(src).unwrap();
        b.finish(count).unwrap()
    }

    fn provider(connector: Arc<ScriptedConnector>) -> RemoteQueryProvider {
        RemoteQueryProvider::new(connector, registry())
    }

    #[tokio::test]
    async fn stream_decodes_lazily_in_order() {
        let connector = ScriptedConnector::new(vec![element(3), element(1), element(2), ResponseFrame::End]);
        let provider = provider(connector.clone());

        let tree = ids_tree();
        let mut stream = provider.execute_sequence(&tree).await.unwrap();
        assert_eq!(0, stream.received());
        assert!(!stream.is_released());

        assert_eq!(Some(Value::Int32(3)), stream.try_next().await.unwrap());
        assert_eq!(1, stream.received());

        let rest = stream.collect_as::<i32>().await.unwrap();
        assert_eq!(vec![1, 2], rest);

        let requests = connector.requests.lock().unwrap();
        assert_eq!(1, requests.len());
        assert_eq!(tree.result_type(), &requests[0].result_type);
    }

    #[tokio::test]
    async fn empty_stream_is_released_immediately() {
        let connector = ScriptedConnector::new(vec![ResponseFrame::End]);
        let stream = provider(connector).execute_sequence(&ids_tree()).await.unwrap();
        assert!(stream.is_released());
        assert!(stream.collect_values().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leading_fault_raised_from_execute() {
        let connector = ScriptedConnector::new(vec![ResponseFrame::Fault(Fault::new(
            ErrorCode::UnresolvedType,
            "unresolved type Item",
        ))]);
        let err = provider(connector).execute(&ids_tree()).await.unwrap_err();
        assert_eq!(Some(ErrorCode::UnresolvedType), err.remote_code());
    }

    #[tokio::test]
    async fn mid_stream_fault_ends_stream() {
        let connector = ScriptedConnector::new(vec![
            element(1),
            ResponseFrame::Fault(Fault::new(ErrorCode::SourceExecution, "replica lost")),
        ]);
        let mut stream = provider(connector).execute_sequence(&ids_tree()).await.unwrap();

        assert_eq!(Some(Value::Int32(1)), stream.next().await.map(|r| r.unwrap()));
        match stream.next().await {
            Some(Err(ClientError::RemoteExecution { code, message })) => {
                assert_eq!(ErrorCode::SourceExecution, code);
                assert_eq!("replica lost", message);
            }
            other => panic!("expected remote fault, got {other:?}"),
        }
        assert!(stream.is_released());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_connection_closed() {
        let connector = ScriptedConnector::new(vec![element(1)]);
        let stream = provider(connector).execute_sequence(&ids_tree()).await.unwrap();
        let err = stream.collect_values().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed), "{err:?}");
    }

    #[tokio::test]
    async fn scalar_result() {
        let connector = ScriptedConnector::new(vec![element(7), ResponseFrame::End]);
        let count: i32 = provider(connector).execute_scalar(&count_tree()).await.unwrap();
        assert_eq!(7, count);
    }

    #[tokio::test]
    async fn scalar_with_extra_element_rejected() {
        let connector = ScriptedConnector::new(vec![element(7), element(8), ResponseFrame::End]);
        let err = provider(connector).execute_scalar::<i32>(&count_tree()).await.unwrap_err();
        assert!(matches!(err, ClientError::Proto(ProtoError::UnexpectedFrame(_))), "{err:?}");
    }

    #[tokio::test]
    async fn shape_checked_before_connecting() {
        let connector = ScriptedConnector::new(vec![ResponseFrame::End]);
        let provider = provider(connector.clone());

        let err = provider.execute_scalar::<i32>(&ids_tree()).await.unwrap_err();
        assert!(matches!(err, ClientError::ShapeMismatch { expected: "scalar", .. }));
        let err = provider.execute_sequence(&count_tree()).await.unwrap_err();
        assert!(matches!(err, ClientError::ShapeMismatch { expected: "sequence", .. }));
        assert_eq!(0, connector.connects());
    }

    #[tokio::test]
    async fn unregistered_extension_fails_before_connecting() {
        let mut b = TreeBuilder::new(registry());
        let word = b.constant("quiet").unwrap();
        let shout = b.extension("Shout", &[word], TypeDescriptor::string()).unwrap();
        let tree = b.finish(shout).unwrap();

        let connector = ScriptedConnector::new(Vec::new());
        let err = provider(connector.clone()).execute(&tree).await.unwrap_err();
        assert!(
            matches!(err, ClientError::Proto(ProtoError::UnsupportedOperation(_))),
            "{err:?}"
        );
        assert_eq!(0, connector.connects());
    }

    #[tokio::test]
    async fn spawned_query_collects_everything() {
        let connector = ScriptedConnector::new(vec![element(1), element(2), ResponseFrame::End]);
        let task = provider(connector).spawn_execute(&ids_tree()).unwrap();
        let output = task.join().await.unwrap();
        assert_eq!(
            Some(vec![Value::Int32(1), Value::Int32(2)]),
            output.into_sequence()
        );
    }

    #[tokio::test]
    async fn cancelled_query() {
        let connector = Arc::new(ScriptedConnector {
            frames: vec![element(1)],
            hold_open: true,
            ..Default::default()
        });
        let task = provider(connector).spawn_execute(&ids_tree()).unwrap();
        task.cancel();
        assert!(matches!(task.join().await, Err(ClientError::Cancelled)));
    }
}
