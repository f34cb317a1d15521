use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use typereg::{TypeDescriptor, wire};

use crate::errors::{ProtoError, Result};
use crate::fault::{ErrorCode, Fault};

/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

mod tag {
    pub const RETRIEVE: u8 = b'R';
    pub const ELEMENT: u8 = b'D';
    pub const END: u8 = b'Z';
    pub const FAULT: u8 = b'E';
}

/// Declared result type plus one encoded tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub result_type: TypeDescriptor,
    pub tree: Bytes,
}

impl RequestEnvelope {
    pub fn new(result_type: TypeDescriptor, tree: Bytes) -> Self {
        RequestEnvelope { result_type, tree }
    }

    fn encode(&self, dst: &mut BytesMut) {
        wire::put_descriptor(dst, &self.result_type);
        dst.put_u32(self.tree.len() as u32);
        dst.put_slice(&self.tree);
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let result_type = wire::get_descriptor(&mut payload)?;
        let len = wire::get_u32(&mut payload, "tree length")? as usize;
        wire::ensure_remaining(&payload, len, "tree")?;
        let tree = payload.split_to(len);
        if !payload.is_empty() {
            return Err(ProtoError::Decode(
                "trailing bytes after request envelope".to_string(),
            ));
        }
        Ok(RequestEnvelope { result_type, tree })
    }
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFrame {
    Retrieve(RequestEnvelope),
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    /// One encoded result element.
    Element(Bytes),
    /// Successful end of the response.
    End,
    Fault(Fault),
}

impl ResponseFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseFrame::Element(_) => "element",
            ResponseFrame::End => "end",
            ResponseFrame::Fault(_) => "fault",
        }
    }
}

fn put_frame(dst: &mut BytesMut, tag: u8, max: usize, body: impl FnOnce(&mut BytesMut)) -> Result<()> {
    let start = dst.len();
    dst.put_u8(tag);

    // Length placeholder.
    let len_idx = dst.len();
    dst.put_u32(0);

    body(dst);

    let payload_len = dst.len() - len_idx - 4;
    if payload_len > max {
        dst.truncate(start);
        return Err(ProtoError::FrameTooLarge {
            size: payload_len,
            max,
        });
    }
    dst[len_idx..len_idx + 4].copy_from_slice(&(payload_len as u32).to_be_bytes());
    Ok(())
}

/// Split one complete frame off the front of `src`.
fn take_frame(src: &mut BytesMut, max: usize) -> Result<Option<(u8, Bytes)>> {
    // Every frame has a tag byte and a u32 length. Return early if we don't
    // even have those.
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = src[0];
    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
    if len > max {
        return Err(ProtoError::FrameTooLarge { size: len, max });
    }

    // Not enough bytes to read the full frame yet.
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(HEADER_LEN + len);
    frame.advance(HEADER_LEN);
    Ok(Some((tag, frame.freeze())))
}

/// Server side codec: decodes requests, encodes responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerCodec {
    max_frame_size: usize,
}

impl ServerCodec {
    pub fn new(max_frame_size: usize) -> Self {
        ServerCodec { max_frame_size }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Encoder<ResponseFrame> for ServerCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
        match item {
            ResponseFrame::Element(bytes) => {
                put_frame(dst, tag::ELEMENT, self.max_frame_size, |dst| dst.put_slice(&bytes))
            }
            ResponseFrame::End => put_frame(dst, tag::END, self.max_frame_size, |_| ()),
            ResponseFrame::Fault(fault) => put_frame(dst, tag::FAULT, self.max_frame_size, |dst| {
                dst.put_u8(fault.code as u8);
                wire::put_str(dst, &fault.message);
            }),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let (tag, payload) = match take_frame(src, self.max_frame_size)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        match tag {
            tag::RETRIEVE => Ok(Some(RequestFrame::Retrieve(RequestEnvelope::decode(payload)?))),
            other => Err(ProtoError::InvalidFrameType(other)),
        }
    }
}

/// Client side codec: encodes requests, decodes responses.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    max_frame_size: usize,
}

impl ClientCodec {
    pub fn new(max_frame_size: usize) -> Self {
        ClientCodec { max_frame_size }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Encoder<RequestFrame> for ClientCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        match item {
            RequestFrame::Retrieve(envelope) => {
                put_frame(dst, tag::RETRIEVE, self.max_frame_size, |dst| envelope.encode(dst))
            }
        }
    }
}

impl Decoder for ClientCodec {
    type Item = ResponseFrame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let (tag, mut payload) = match take_frame(src, self.max_frame_size)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let frame = match tag {
            tag::ELEMENT => ResponseFrame::Element(payload),
            tag::END => {
                if !payload.is_empty() {
                    return Err(ProtoError::Decode("end frame with payload".to_string()));
                }
                ResponseFrame::End
            }
            tag::FAULT => {
                let code = wire::get_u8(&mut payload, "fault code")?;
                let code = ErrorCode::from_u8(code).unwrap_or(ErrorCode::Internal);
                let message = wire::get_str(&mut payload, "fault message")?;
                ResponseFrame::Fault(Fault::new(code, message))
            }
            other => return Err(ProtoError::InvalidFrameType(other)),
        };
        Ok(Some(frame))
    }
}
