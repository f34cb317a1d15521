use std::sync::Arc;

use exprproto::{
    Fault, RequestEnvelope, RequestFrame, ResponseFrame, ResultEncoder, SequenceError, ServerCodec,
    TreeDecoder, write_encoded_scalar, write_fault,
};
use futures::{Sink, SinkExt, StreamExt};
use queryexec::{BoundQuery, DataSource, Evaluator, ExtensionRegistry, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use typereg::{BinaryValueCodec, ResultShape, TypeRegistry, ValueCodec};
use uuid::Uuid;

use crate::config::HandlerConfig;
use crate::errors::{Result, SrvError};
use crate::state::HandlerState;

/// What happened to a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveOutcome {
    /// Shape of the result, if the request got far enough to know it.
    pub shape: Option<ResultShape>,
    /// Elements produced by the data source.
    pub elements: u64,
    /// Fault reported to the client, if any.
    pub fault: Option<Fault>,
}

impl RetrieveOutcome {
    fn failed(shape: Option<ResultShape>, elements: u64, fault: Fault) -> Self {
        RetrieveOutcome {
            shape,
            elements,
            fault: Some(fault),
        }
    }

    pub fn is_success(&self) -> bool {
        self.fault.is_none()
    }
}

/// Executes received expression trees against a data source.
///
/// The handler owns one data source handle and serves one request at a
/// time. Concurrent requests need one handler per request, or external
/// serialization.
pub struct RemoteQueryHandler<S: DataSource> {
    source: S,
    registry: Arc<TypeRegistry>,
    codec: Arc<dyn ValueCodec>,
    extensions: ExtensionRegistry,
    config: HandlerConfig,
}

impl<S: DataSource> RemoteQueryHandler<S> {
    pub fn new(source: S, registry: Arc<TypeRegistry>) -> Self {
        let codec = Arc::new(BinaryValueCodec::with_registry(registry.clone()));
        RemoteQueryHandler {
            source,
            registry,
            codec,
            extensions: ExtensionRegistry::new(),
            config: HandlerConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Serve exactly one request on `conn`.
    pub async fn handle_connection<C>(&mut self, conn: C) -> Result<RetrieveOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(conn, ServerCodec::new(self.config.max_frame_size));

        let request = match framed.next().await {
            Some(Ok(RequestFrame::Retrieve(request))) => request,
            Some(Err(e)) => {
                warn!(%e, "failed to read request");
                let fault = Fault::from(&e);
                if let Err(e) = write_fault(&mut framed, fault).await {
                    debug!(%e, "failed to send fault for unreadable request");
                }
                return Err(e.into());
            }
            None => return Err(SrvError::NoRequest),
        };
        trace!(tree_bytes = request.tree.len(), "read request");

        let outcome = self.retrieve(request, &mut framed).await?;
        if let Err(e) = framed.close().await {
            debug!(%e, "failed to close connection");
        }
        Ok(outcome)
    }

    /// Execute one request, writing the response to `sink`.
    ///
    /// Execution failures are reported to the client as a fault and in the
    /// returned outcome. Only failures of the handler itself are returned as
    /// errors.
    pub async fn retrieve<K>(&mut self, request: RequestEnvelope, sink: &mut K) -> Result<RetrieveOutcome>
    where
        K: Sink<ResponseFrame, Error = exprproto::ProtoError> + Unpin + Send,
    {
        let request_id = Uuid::new_v4();
        let span = info_span!("retrieve", %request_id, declared = %request.result_type);
        self.retrieve_inner(request, sink).instrument(span).await
    }

    fn bind(&self, request: &RequestEnvelope) -> Result<BoundQuery> {
        let decoder = TreeDecoder::new(self.codec.clone()).with_extensions(self.extensions.names());
        let tree = decoder.decode(&request.tree)?;
        if self.config.log_trees {
            debug!(%tree, nodes = tree.len(), "decoded tree");
        }
        Ok(BoundQuery::bind(
            tree,
            request.result_type.clone(),
            &self.registry,
        )?)
    }

    async fn retrieve_inner<K>(&mut self, request: RequestEnvelope, sink: &mut K) -> Result<RetrieveOutcome>
    where
        K: Sink<ResponseFrame, Error = exprproto::ProtoError> + Unpin + Send,
    {
        let mut state = HandlerState::Idle;

        let query = match self.bind(&request) {
            Ok(query) => query,
            Err(e) => {
                state.transition(HandlerState::Closed)?;
                let outcome = RetrieveOutcome::failed(None, 0, Fault::from(&e));
                send_fault(sink, &outcome).await;
                return Ok(outcome);
            }
        };
        let shape = query.shape().clone();
        info!(%shape, "executing query");

        let encoder = ResultEncoder::new(self.codec.clone());
        let mut session = Session::new(&mut self.source);

        state.transition(HandlerState::SessionOpen)?;
        if let Err(e) = session.open() {
            // Started or not, the session is closed exactly once.
            if let Err(e) = session.close() {
                warn!(%e, "failed to close session after failed start");
            }
            state.transition(HandlerState::Closed)?;
            let outcome = RetrieveOutcome::failed(Some(shape), 0, Fault::from(&e));
            send_fault(sink, &outcome).await;
            return Ok(outcome);
        }

        if shape.is_stream() {
            state.transition(HandlerState::Streaming)?;

            let mut produced = 0;
            let written = match session
                .source()
                .and_then(|source| Evaluator::new(&query, source, &self.extensions).stream())
            {
                Ok(items) => {
                    let items = items.inspect(|item| {
                        if item.is_ok() {
                            produced += 1;
                        }
                    });
                    encoder.write_sequence(sink, items).await
                }
                Err(e) => Err(SequenceError::Source(e)),
            };

            if let Err(e) = session.close() {
                warn!(%e, "failed to close session");
            }
            state.transition(HandlerState::Closed)?;

            match written {
                Ok(elements) => {
                    info!(elements, "streamed query result");
                    Ok(RetrieveOutcome {
                        shape: Some(shape),
                        elements,
                        fault: None,
                    })
                }
                Err(SequenceError::Source(e)) => {
                    let outcome = RetrieveOutcome::failed(Some(shape), produced, Fault::from(&e));
                    send_fault(sink, &outcome).await;
                    Ok(outcome)
                }
                Err(SequenceError::Write(e)) => {
                    // Either the element couldn't be encoded, or the client
                    // went away. A fault is only useful in the first case but
                    // sending one is harmless in the second.
                    let outcome = RetrieveOutcome::failed(Some(shape), produced, Fault::from(&e));
                    send_fault(sink, &outcome).await;
                    Ok(outcome)
                }
            }
        } else {
            state.transition(HandlerState::SingleShot)?;

            let encoded = session
                .source()
                .and_then(|source| Evaluator::new(&query, source, &self.extensions).scalar())
                .map_err(SrvError::from)
                .and_then(|value| Ok(encoder.encode_element(&value)?));

            if let Err(e) = session.close() {
                warn!(%e, "failed to close session");
            }
            state.transition(HandlerState::Closed)?;

            match encoded {
                Ok(element) => {
                    write_encoded_scalar(sink, element).await?;
                    info!("sent scalar query result");
                    Ok(RetrieveOutcome {
                        shape: Some(shape),
                        elements: 1,
                        fault: None,
                    })
                }
                Err(e) => {
                    let outcome = RetrieveOutcome::failed(Some(shape), 0, Fault::from(&e));
                    send_fault(sink, &outcome).await;
                    Ok(outcome)
                }
            }
        }
    }
}

/// Best effort, the client may already be gone.
async fn send_fault<K>(sink: &mut K, outcome: &RetrieveOutcome)
where
    K: Sink<ResponseFrame, Error = exprproto::ProtoError> + Unpin,
{
    let Some(fault) = &outcome.fault else {
        return;
    };
    warn!(code = %fault.code, message = %fault.message, "query failed");
    if let Err(e) = write_fault(sink, fault.clone()).await {
        debug!(%e, "failed to send fault");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use exprproto::{ClientCodec, ErrorCode, TreeEncoder};
    use exprtree::{ExprId, TreeBuilder};
    use queryexec::MemoryDataSource;
    use typereg::{EntitySchema, MemberSchema, Record, TypeDescriptor, TypeRegistryBuilder, Value};

    use super::*;

    fn item() -> TypeDescriptor {
        TypeDescriptor::entity("Item", 1)
    }

    fn item_schema() -> EntitySchema {
        EntitySchema::new(
            item(),
            vec![
                MemberSchema::new("Id", TypeDescriptor::int32()),
                MemberSchema::new("Price", TypeDescriptor::int64()),
            ],
        )
    }

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistryBuilder::new()
            .register(item_schema())
            .unwrap()
            .build()
            .unwrap()
    }

    fn rows(n: i32) -> Vec<Value> {
        (1..=n)
            .map(|id| {
                Value::Record(Record::new(
                    item(),
                    vec![
                        ("Id".to_string(), Value::Int32(id)),
                        ("Price".to_string(), Value::Int64(id as i64 * 10)),
                    ],
                ))
            })
            .collect()
    }

    fn handler(source: MemoryDataSource) -> RemoteQueryHandler<MemoryDataSource> {
        RemoteQueryHandler::new(source, registry())
            .with_config(HandlerConfig::builder().with_log_trees(true).build())
    }

    fn encode(
        registry: Arc<TypeRegistry>,
        build: impl FnOnce(&mut TreeBuilder) -> exprtree::Result<ExprId>,
    ) -> (TypeDescriptor, Bytes) {
        let mut b = TreeBuilder::new(registry.clone());
        let root = build(&mut b).unwrap();
        let tree = b.finish(root).unwrap();
        let encoder = TreeEncoder::new(Arc::new(BinaryValueCodec::with_registry(registry)));
        (tree.result_type().clone(), encoder.encode(&tree).unwrap())
    }

    async fn exchange(
        handler: &mut RemoteQueryHandler<MemoryDataSource>,
        declared: TypeDescriptor,
        tree: Bytes,
    ) -> (RetrieveOutcome, Vec<ResponseFrame>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = async move {
            let mut framed = Framed::new(client_io, ClientCodec::default());
            framed
                .send(RequestFrame::Retrieve(RequestEnvelope::new(declared, tree)))
                .await
                .unwrap();
            let mut frames = Vec::new();
            while let Some(frame) = framed.next().await {
                frames.push(frame.unwrap());
            }
            frames
        };
        let (outcome, frames) = tokio::join!(handler.handle_connection(server_io), client);
        (outcome.unwrap(), frames)
    }

    fn decode_ids(frames: &[ResponseFrame]) -> Vec<i32> {
        let codec = BinaryValueCodec::new();
        frames
            .iter()
            .filter_map(|frame| match frame {
                ResponseFrame::Element(bytes) => {
                    let value = codec.decode(&mut bytes.clone(), &item()).unwrap();
                    Some(value.field("Id").and_then(Value::as_i64).unwrap() as i32)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streams_elements_in_order() {
        let source = MemoryDataSource::new().with_table(&item(), rows(5));
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| {
            let src = b.source(item())?;
            b.filter(src, |b, e| {
                let price = b.member(e, "Price")?;
                let limit = b.constant(20i64)?;
                b.gt(price, limit)
            })
        });
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        assert!(outcome.is_success());
        assert_eq!(3, outcome.elements);
        assert_eq!(vec![3, 4, 5], decode_ids(&frames));
        assert_eq!(Some(&ResponseFrame::End), frames.last());
        assert_eq!(1, counters.started());
        assert_eq!(1, counters.closed());
    }

    #[tokio::test]
    async fn empty_stream_is_just_end() {
        let source = MemoryDataSource::new().with_table(&item(), Vec::new());
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| b.source(item()));
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        assert!(outcome.is_success());
        assert_eq!(vec![ResponseFrame::End], frames);
    }

    #[tokio::test]
    async fn scalar_result() {
        let source = MemoryDataSource::new().with_table(&item(), rows(7));
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| {
            let src = b.source(item())?;
            b.count(src)
        });
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        assert!(outcome.is_success());
        assert_eq!(2, frames.len());
        let value = match &frames[0] {
            ResponseFrame::Element(bytes) => BinaryValueCodec::new()
                .decode(&mut bytes.clone(), &TypeDescriptor::int32())
                .unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(Value::Int32(7), value);
        assert_eq!(ResponseFrame::End, frames[1]);
        assert_eq!(1, counters.closed());
    }

    #[tokio::test]
    async fn unknown_entity_faults() {
        let contractor = TypeDescriptor::entity("Contractor", 1);
        let client_registry = TypeRegistryBuilder::new()
            .register(item_schema())
            .unwrap()
            .register(EntitySchema::new(contractor.clone(), Vec::new()))
            .unwrap()
            .build()
            .unwrap();

        let source = MemoryDataSource::new();
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(client_registry, |b| b.source(contractor.clone()));
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        let fault = outcome.fault.unwrap();
        assert_eq!(ErrorCode::UnresolvedType, fault.code);
        assert_eq!(vec![ResponseFrame::Fault(fault)], frames);
        assert_eq!(0, counters.started());
        assert_eq!(0, counters.closed());
    }

    #[tokio::test]
    async fn mid_stream_failure() {
        let source = MemoryDataSource::new()
            .with_table(&item(), rows(5))
            .with_failure(&item(), 2, "replica lost");
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| b.source(item()));
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        assert_eq!(2, outcome.elements);
        assert_eq!(vec![1, 2], decode_ids(&frames));
        match frames.last() {
            Some(ResponseFrame::Fault(fault)) => {
                assert_eq!(ErrorCode::SourceExecution, fault.code);
                assert!(fault.message.contains("replica lost"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(1, counters.closed());
    }

    #[tokio::test]
    async fn failed_start_closes_once() {
        let source = MemoryDataSource::new()
            .with_table(&item(), rows(1))
            .with_start_failure("pool exhausted");
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| b.source(item()));
        let (outcome, frames) = exchange(&mut handler, declared, tree).await;

        assert_eq!(Some(ErrorCode::SourceExecution), outcome.fault.map(|f| f.code));
        assert_eq!(1, frames.len());
        assert_eq!(1, counters.failed_starts());
        assert_eq!(1, counters.closed());
    }

    #[tokio::test]
    async fn client_abandons_stream() {
        let source = MemoryDataSource::new().with_table(&item(), rows(5000));
        let counters = source.counters();
        let mut handler = handler(source);

        let (declared, tree) = encode(registry(), |b| b.source(item()));
        // Small buffer so the server blocks on writes long before the source
        // is drained.
        let (client_io, server_io) = tokio::io::duplex(64);
        let client = async move {
            let mut framed = Framed::new(client_io, ClientCodec::default());
            framed
                .send(RequestFrame::Retrieve(RequestEnvelope::new(declared, tree)))
                .await
                .unwrap();
            let first = framed.next().await.unwrap().unwrap();
            assert!(matches!(first, ResponseFrame::Element(_)));
        };
        let (outcome, ()) = tokio::join!(handler.handle_connection(server_io), client);

        let outcome = outcome.unwrap();
        assert!(outcome.fault.is_some());
        assert!(outcome.elements < 5000);
        assert_eq!(1, counters.closed());
        assert!(counters.rows_produced() < 5000);
    }
}
