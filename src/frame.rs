//! Wire frames exchanged on the byte stream of a single call.
//!
//! Each frame is a little-endian `u32` length followed by a bincode body.
//! End-of-stream is its own frame variant, so an empty payload is still an
//! ordinary message.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{RpcError, Status};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPattern::Unary => "unary",
            CallPattern::ServerStreaming => "server-streaming",
            CallPattern::ClientStreaming => "client-streaming",
            CallPattern::BidiStreaming => "bidi-streaming",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame of every call, sent by the client.
    Open {
        method: String,
        pattern: CallPattern,
        timeout_ms: Option<u64>,
    },
    Message(Vec<u8>),
    /// No more messages in this direction.
    End,
    /// Terminal failure, sent by the server in place of `End`.
    Status(Status),
    /// The caller gave up on the call.
    Cancel,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let body = src.split_to(len);
        let frame = bincode::deserialize(&body)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        let body = bincode::serialize(&frame)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
                body.len()
            )));
        }

        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Code;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let mut wire = encode(Frame::Message(b"hello".to_vec()));
        wire.extend_from_slice(&encode(Frame::End));

        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(3) {
            buffer.extend_from_slice(chunk);
            while let Some(frame) = FrameCodec.decode(&mut buffer).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, vec![Frame::Message(b"hello".to_vec()), Frame::End]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_payload_is_not_end_of_stream() {
        let mut buffer = encode(Frame::Message(Vec::new()));
        assert_eq!(
            FrameCodec.decode(&mut buffer).unwrap(),
            Some(Frame::Message(Vec::new()))
        );
    }

    #[test]
    fn open_and_status_frames_keep_their_fields() {
        let mut buffer = encode(Frame::Open {
            method: "GreetService.Greet".into(),
            pattern: CallPattern::Unary,
            timeout_ms: Some(1500),
        });
        buffer.extend_from_slice(&encode(Frame::Status(Status::deadline_exceeded("late"))));

        match FrameCodec.decode(&mut buffer).unwrap() {
            Some(Frame::Open {
                method,
                pattern,
                timeout_ms,
            }) => {
                assert_eq!(method, "GreetService.Greet");
                assert_eq!(pattern, CallPattern::Unary);
                assert_eq!(timeout_ms, Some(1500));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        match FrameCodec.decode(&mut buffer).unwrap() {
            Some(Frame::Status(status)) => assert_eq!(status.code(), Code::DeadlineExceeded),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut buffer = BytesMut::new();
        buffer.put_u32_le((MAX_FRAME_LEN + 1) as u32);
        let err = FrameCodec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, RpcError::ProtocolError(_)));
    }

    #[test]
    fn waits_for_complete_body() {
        let full = encode(Frame::Message(vec![7; 64]));
        let mut buffer = BytesMut::from(&full[..10]);
        assert!(FrameCodec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 10);
    }
}
