use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt, ready};
use tracing::trace;
use typereg::{TypeDescriptor, Value, ValueCodec};

use crate::errors::{ProtoError, Result};
use crate::fault::Fault;
use crate::frame::ResponseFrame;

/// Failure while writing a sequence: either the producer of the elements or
/// the sink failed.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError<E> {
    #[error("{0}")]
    Source(E),
    #[error(transparent)]
    Write(ProtoError),
}

/// Writes response bodies.
#[derive(Debug, Clone)]
pub struct ResultEncoder {
    codec: Arc<dyn ValueCodec>,
}

impl ResultEncoder {
    pub fn new(codec: Arc<dyn ValueCodec>) -> Self {
        ResultEncoder { codec }
    }

    pub fn encode_element(&self, value: &Value) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.codec.encode(value, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Write one element frame per item, in production order, then `End`.
    ///
    /// Each frame write is awaited before the next item is pulled, so a slow
    /// reader slows down production. Stops at the first failing item without
    /// writing `End`. Returns the number of elements written.
    pub async fn write_sequence<S, I, E>(
        &self,
        sink: &mut S,
        items: I,
    ) -> Result<u64, SequenceError<E>>
    where
        S: Sink<ResponseFrame, Error = ProtoError> + Unpin,
        I: IntoIterator<Item = Result<Value, E>>,
    {
        let mut count = 0;
        for item in items {
            let value = item.map_err(SequenceError::Source)?;
            let element = self.encode_element(&value).map_err(SequenceError::Write)?;
            sink.send(ResponseFrame::Element(element))
                .await
                .map_err(SequenceError::Write)?;
            count += 1;
            trace!(count, "wrote element");
        }
        sink.send(ResponseFrame::End)
            .await
            .map_err(SequenceError::Write)?;
        Ok(count)
    }

    /// Write exactly one element and `End`.
    pub async fn write_scalar<S>(&self, sink: &mut S, value: &Value) -> Result<()>
    where
        S: Sink<ResponseFrame, Error = ProtoError> + Unpin,
    {
        let element = self.encode_element(value)?;
        write_encoded_scalar(sink, element).await
    }
}

/// Write an already encoded scalar element and `End`.
pub async fn write_encoded_scalar<S>(sink: &mut S, element: Bytes) -> Result<()>
where
    S: Sink<ResponseFrame, Error = ProtoError> + Unpin,
{
    sink.feed(ResponseFrame::Element(element)).await?;
    sink.send(ResponseFrame::End).await
}

pub async fn write_fault<S>(sink: &mut S, fault: Fault) -> Result<()>
where
    S: Sink<ResponseFrame, Error = ProtoError> + Unpin,
{
    sink.send(ResponseFrame::Fault(fault)).await
}

/// Read a scalar response: exactly one element followed by `End`.
pub async fn read_scalar<S>(
    frames: &mut S,
    codec: &dyn ValueCodec,
    ty: &TypeDescriptor,
) -> Result<Value>
where
    S: Stream<Item = Result<ResponseFrame>> + Unpin,
{
    let mut element = match frames.next().await {
        Some(Ok(ResponseFrame::Element(bytes))) => bytes,
        Some(Ok(ResponseFrame::Fault(fault))) => return Err(ProtoError::Fault(fault)),
        Some(Ok(ResponseFrame::End)) => {
            return Err(ProtoError::UnexpectedFrame("end before scalar element"));
        }
        Some(Err(e)) => return Err(e),
        None => return Err(ProtoError::UnexpectedEof),
    };

    match frames.next().await {
        Some(Ok(ResponseFrame::End)) => (),
        Some(Ok(ResponseFrame::Fault(fault))) => return Err(ProtoError::Fault(fault)),
        Some(Ok(ResponseFrame::Element(_))) => {
            return Err(ProtoError::UnexpectedFrame("second element in scalar response"));
        }
        Some(Err(e)) => return Err(e),
        None => return Err(ProtoError::UnexpectedEof),
    }

    let value = codec.decode(&mut element, ty)?;
    if !element.is_empty() {
        return Err(ProtoError::Decode("trailing bytes after element".to_string()));
    }
    Ok(value)
}

/// Lazily decodes a streamed response.
///
/// Yields one decoded element per `Element` frame until `End`. A `Fault`
/// frame, a malformed element or a connection that ends early is yielded as
/// an error, after which the stream is finished. The underlying frame stream
/// is dropped as soon as the stream finishes.
#[derive(Debug)]
pub struct ElementStream<S> {
    frames: Option<S>,
    pending: Option<Bytes>,
    codec: Arc<dyn ValueCodec>,
    element: TypeDescriptor,
    received: u64,
}

impl<S> ElementStream<S>
where
    S: Stream<Item = Result<ResponseFrame>> + Unpin,
{
    pub fn new(frames: S, codec: Arc<dyn ValueCodec>, element: TypeDescriptor) -> Self {
        ElementStream {
            frames: Some(frames),
            pending: None,
            codec,
            element,
            received: 0,
        }
    }

    /// Read the first frame without decoding it.
    ///
    /// A leading fault is returned here instead of from the stream.
    pub async fn prefetch(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        let frames = match self.frames.as_mut() {
            Some(frames) => frames,
            None => return Ok(()),
        };
        match frames.next().await {
            Some(Ok(ResponseFrame::Element(bytes))) => {
                self.pending = Some(bytes);
                Ok(())
            }
            Some(Ok(ResponseFrame::End)) => {
                self.finish();
                Ok(())
            }
            Some(Ok(ResponseFrame::Fault(fault))) => {
                self.finish();
                Err(ProtoError::Fault(fault))
            }
            Some(Err(e)) => {
                self.finish();
                Err(e)
            }
            None => {
                self.finish();
                Err(ProtoError::UnexpectedEof)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.frames.is_none() && self.pending.is_none()
    }

    /// Number of elements yielded so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn element_type(&self) -> &TypeDescriptor {
        &self.element
    }

    fn finish(&mut self) {
        if self.frames.take().is_some() {
            trace!(received = self.received, "element stream finished");
        }
    }

    fn decode(&mut self, mut bytes: Bytes) -> Result<Value> {
        let value = self.codec.decode(&mut bytes, &self.element)?;
        if !bytes.is_empty() {
            return Err(ProtoError::Decode("trailing bytes after element".to_string()));
        }
        self.received += 1;
        Ok(value)
    }
}

impl<S> Stream for ElementStream<S>
where
    S: Stream<Item = Result<ResponseFrame>> + Unpin,
{
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(bytes) = this.pending.take() {
            let result = this.decode(bytes);
            if result.is_err() {
                this.finish();
            }
            return Poll::Ready(Some(result));
        }

        let frames = match this.frames.as_mut() {
            Some(frames) => frames,
            None => return Poll::Ready(None),
        };

        let item = match ready!(frames.poll_next_unpin(cx)) {
            Some(Ok(ResponseFrame::Element(bytes))) => {
                let result = this.decode(bytes);
                if result.is_err() {
                    this.finish();
                }
                Some(result)
            }
            Some(Ok(ResponseFrame::End)) => {
                this.finish();
                None
            }
            Some(Ok(ResponseFrame::Fault(fault))) => {
                this.finish();
                Some(Err(ProtoError::Fault(fault)))
            }
            Some(Err(e)) => {
                this.finish();
                Some(Err(e))
            }
            None => {
                this.finish();
                Some(Err(ProtoError::UnexpectedEof))
            }
        };
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use typereg::BinaryValueCodec;

    use super::*;
    use crate::fault::ErrorCode;

    fn codec() -> Arc<dyn ValueCodec> {
        Arc::new(BinaryValueCodec::new())
    }

    #[tokio::test]
    async fn sequence_frames() {
        let encoder = ResultEncoder::new(codec());
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut sink = tx.sink_map_err(|_| ProtoError::UnexpectedEof);

        let items = vec![
            Ok::<_, std::convert::Infallible>(Value::Int32(1)),
            Ok(Value::Int32(2)),
        ];
        let count = encoder.write_sequence(&mut sink, items).await.unwrap();
        assert_eq!(2, count);
        drop(sink);

        let frames: Vec<_> = rx.collect().await;
        assert_eq!(3, frames.len());
        assert_eq!(ResponseFrame::End, frames[2]);

        let stream = ElementStream::new(
            stream::iter(frames.into_iter().map(Ok)),
            codec(),
            TypeDescriptor::int32(),
        );
        let values: Vec<_> = stream.map(|v| v.unwrap()).collect().await;
        assert_eq!(vec![Value::Int32(1), Value::Int32(2)], values);
    }

    #[tokio::test]
    async fn empty_sequence_is_only_end() {
        let encoder = ResultEncoder::new(codec());
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut sink = tx.sink_map_err(|_| ProtoError::UnexpectedEof);
        let count = encoder
            .write_sequence(&mut sink, Vec::<Result<Value, String>>::new())
            .await
            .unwrap();
        assert_eq!(0, count);
        drop(sink);
        assert_eq!(vec![ResponseFrame::End], rx.collect::<Vec<_>>().await);
    }

    #[tokio::test]
    async fn source_failure_stops_without_end() {
        let encoder = ResultEncoder::new(codec());
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut sink = tx.sink_map_err(|_| ProtoError::UnexpectedEof);
        let items = vec![Ok(Value::Int32(1)), Err("boom".to_string()), Ok(Value::Int32(3))];
        let err = encoder.write_sequence(&mut sink, items).await.unwrap_err();
        assert!(matches!(err, SequenceError::Source(ref msg) if msg == "boom"));
        drop(sink);

        let frames: Vec<_> = rx.collect().await;
        assert_eq!(1, frames.len());
    }

    #[tokio::test]
    async fn scalar_round_trip() {
        let encoder = ResultEncoder::new(codec());
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut sink = tx.sink_map_err(|_| ProtoError::UnexpectedEof);
        encoder.write_scalar(&mut sink, &Value::Int32(13)).await.unwrap();
        drop(sink);

        let mut frames = rx.map(Ok);
        let value = read_scalar(&mut frames, &BinaryValueCodec::new(), &TypeDescriptor::int32())
            .await
            .unwrap();
        assert_eq!(Value::Int32(13), value);
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn scalar_rejects_extra_element() {
        let encoder = ResultEncoder::new(codec());
        let element = encoder.encode_element(&Value::Int32(13)).unwrap();
        let mut frames = stream::iter(vec![
            Ok(ResponseFrame::Element(element.clone())),
            Ok(ResponseFrame::Element(element)),
            Ok(ResponseFrame::End),
        ]);
        let err = read_scalar(&mut frames, &BinaryValueCodec::new(), &TypeDescriptor::int32())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedFrame(_)), "{err}");
    }

    #[tokio::test]
    async fn fault_after_prefix() {
        let encoder = ResultEncoder::new(codec());
        let element = encoder.encode_element(&Value::from("a")).unwrap();
        let frames = stream::iter(vec![
            Ok(ResponseFrame::Element(element)),
            Ok(ResponseFrame::Fault(Fault::new(ErrorCode::SourceExecution, "boom"))),
        ]);
        let mut stream = ElementStream::new(frames, codec(), TypeDescriptor::string());
        stream.prefetch().await.unwrap();

        assert_eq!(Value::from("a"), stream.next().await.unwrap().unwrap());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProtoError::Fault(ref f) if f.code == ErrorCode::SourceExecution));
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn leading_fault_from_prefetch() {
        let frames = stream::iter(vec![Ok(ResponseFrame::Fault(Fault::new(
            ErrorCode::UnresolvedType,
            "unknown",
        )))]);
        let mut stream = ElementStream::new(frames, codec(), TypeDescriptor::string());
        let err = stream.prefetch().await.unwrap_err();
        assert!(matches!(err, ProtoError::Fault(_)));
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn truncated_stream() {
        let frames = stream::iter(Vec::<Result<ResponseFrame>>::new());
        let mut stream = ElementStream::new(frames, codec(), TypeDescriptor::string());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedEof));
    }
}
