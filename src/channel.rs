//! Typed message channel on top of a call's byte stream.
//!
//! [`FrameWriter`] and [`FrameReader`] move [`Frame`]s over the transport
//! halves. [`RequestSink`] and [`Streaming`] add the typed, per-direction
//! view used by drivers and handlers: messages in send order, followed by an
//! explicit [`Received::EndOfStream`] that is never confused with a payload.

use std::future::pending;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::BytesMut;
use futures::Stream;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{RpcError, Status};
use crate::frame::{Frame, FrameCodec};
use crate::transport::{ReceiveHalf, SendHalf};

pub struct FrameWriter {
    sender: Box<dyn SendHalf>,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameWriter {
    pub fn new(sender: Box<dyn SendHalf>) -> Self {
        Self {
            sender,
            codec: FrameCodec,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    pub async fn write(&mut self, frame: Frame) -> Result<(), RpcError> {
        self.codec.encode(frame, &mut self.buffer)?;
        let data = self.buffer.split().freeze();
        self.sender.send_bytes(data).await
    }

    pub async fn finish(&mut self) -> Result<(), RpcError> {
        self.sender.finish().await
    }
}

pub struct FrameReader {
    receiver: Box<dyn ReceiveHalf>,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(receiver: Box<dyn ReceiveHalf>) -> Self {
        Self {
            receiver,
            codec: FrameCodec,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Reads the next frame. `Ok(None)` means the transport closed cleanly
    /// on a frame boundary.
    pub async fn read(&mut self) -> Result<Option<Frame>, RpcError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            match self.receiver.receive_bytes().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    return Err(RpcError::ProtocolError(format!(
                        "transport closed with {} bytes of an incomplete frame",
                        self.buffer.len()
                    )))
                }
            }
        }
    }
}

/// One step of an inbound direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Received<T> {
    Message(T),
    /// The peer will send nothing more in this direction.
    EndOfStream,
}

impl<T> Received<T> {
    pub fn into_message(self) -> Option<T> {
        match self {
            Received::Message(message) => Some(message),
            Received::EndOfStream => None,
        }
    }
}

/// Outbound direction of a client call.
pub struct RequestSink<T> {
    writer: FrameWriter,
    closed: bool,
    sent: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> RequestSink<T> {
    pub(crate) fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            closed: false,
            sent: 0,
            _marker: PhantomData,
        }
    }

    pub async fn send(&mut self, message: &T) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::StreamError(
                "cannot send after end-of-stream".into(),
            ));
        }
        let payload = bincode::serialize(message)?;
        self.writer.write(Frame::Message(payload)).await?;
        self.sent += 1;
        Ok(())
    }

    /// Signals end-of-stream for the outbound direction. Idempotent.
    pub async fn close(&mut self) -> Result<(), RpcError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.write(Frame::End).await
    }

    /// Tells the server the call is abandoned and releases the stream.
    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        self.closed = true;
        self.writer.write(Frame::Cancel).await?;
        self.writer.finish().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of messages handed to the transport so far.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundState {
    Open,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Deadline,
    Idle(Duration),
    Cancelled,
}

impl Interrupt {
    fn into_status(self) -> Status {
        match self {
            Interrupt::Deadline => Status::deadline_exceeded("deadline exceeded"),
            Interrupt::Idle(timeout) => Status::deadline_exceeded(format!(
                "no message received within {timeout:?}"
            )),
            Interrupt::Cancelled => Status::cancelled("the call was canceled by the caller"),
        }
    }
}

/// Inbound direction of a call: requests on the server, responses on the client.
pub struct Streaming<T> {
    reader: FrameReader,
    state: InboundState,
    deadline: Option<Instant>,
    idle_timeout: Option<Duration>,
    caller_cancel: Option<CancellationToken>,
    peer_cancel: Option<CancellationToken>,
    sender: Option<FrameWriter>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Streaming<T> {
    pub(crate) fn new(reader: FrameReader) -> Self {
        Self {
            reader,
            state: InboundState::Open,
            deadline: None,
            idle_timeout: None,
            caller_cancel: None,
            peer_cancel: None,
            sender: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Client side: stop waiting once the caller cancels.
    pub(crate) fn with_caller_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.caller_cancel = token;
        self
    }

    /// Server side: cancel `token` when the client sends `Cancel`.
    pub(crate) fn with_peer_cancellation(mut self, token: CancellationToken) -> Self {
        self.peer_cancel = Some(token);
        self
    }

    /// Keeps the outbound direction open for the life of the call and uses it
    /// to tell the server when the caller gives up.
    pub(crate) fn with_sender(mut self, sender: FrameWriter) -> Self {
        self.sender = Some(sender);
        self
    }

    pub async fn recv(&mut self) -> Result<Received<T>, RpcError> {
        match self.state {
            InboundState::Ended => return Ok(Received::EndOfStream),
            InboundState::Failed => {
                return Err(RpcError::StreamError("inbound stream already failed".into()))
            }
            InboundState::Open => {}
        }

        let frame = match self.next_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                self.state = InboundState::Failed;
                return Err(err);
            }
        };

        match frame {
            Some(Frame::Message(payload)) => match bincode::deserialize(&payload) {
                Ok(message) => Ok(Received::Message(message)),
                Err(err) => {
                    self.state = InboundState::Failed;
                    Err(err.into())
                }
            },
            Some(Frame::End) => {
                self.state = InboundState::Ended;
                self.release_sender().await;
                Ok(Received::EndOfStream)
            }
            Some(Frame::Status(status)) => {
                self.state = InboundState::Failed;
                self.release_sender().await;
                Err(status.into())
            }
            Some(Frame::Cancel) => {
                self.state = InboundState::Failed;
                if let Some(token) = &self.peer_cancel {
                    token.cancel();
                }
                Err(Status::cancelled("the client has canceled the request").into())
            }
            Some(Frame::Open { method, .. }) => {
                self.state = InboundState::Failed;
                Err(RpcError::ProtocolError(format!(
                    "unexpected open frame for {method} inside a call"
                )))
            }
            None => {
                self.state = InboundState::Failed;
                if let Some(token) = &self.peer_cancel {
                    token.cancel();
                }
                Err(RpcError::StreamError(
                    "stream closed before end-of-stream".into(),
                ))
            }
        }
    }

    /// Convenience over [`Streaming::recv`]: `Ok(None)` at end-of-stream.
    pub async fn message(&mut self) -> Result<Option<T>, RpcError> {
        self.recv().await.map(Received::into_message)
    }

    pub fn is_terminated(&self) -> bool {
        self.state != InboundState::Open
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<T, RpcError>> + Send
    where
        T: Send + 'static,
    {
        async_stream::stream! {
            loop {
                match self.recv().await {
                    Ok(Received::Message(message)) => yield Ok(message),
                    Ok(Received::EndOfStream) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        let wakeup = self.next_wakeup();
        let interrupt = {
            let Self {
                reader,
                caller_cancel,
                ..
            } = &mut *self;
            let timer = async {
                match wakeup {
                    Some((at, interrupt)) => {
                        sleep_until(at).await;
                        interrupt
                    }
                    None => pending().await,
                }
            };
            let cancelled = async {
                match caller_cancel.as_ref() {
                    Some(token) => token.cancelled().await,
                    None => pending().await,
                }
            };

            tokio::select! {
                biased;
                () = cancelled => Interrupt::Cancelled,
                interrupt = timer => interrupt,
                frame = reader.read() => return frame,
            }
        };

        debug!(?interrupt, "inbound wait interrupted");
        if let Some(sender) = self.sender.as_mut() {
            if let Err(err) = sender.write(Frame::Cancel).await {
                debug!("could not deliver cancel frame: {err}");
            }
        }
        Err(interrupt.into_status().into())
    }

    fn next_wakeup(&self) -> Option<(Instant, Interrupt)> {
        let idle = self.idle_timeout.and_then(|timeout| {
            let at = Instant::now().checked_add(timeout)?;
            Some((at, Interrupt::Idle(timeout)))
        });
        let deadline = self.deadline.map(|at| (at, Interrupt::Deadline));
        match (deadline, idle) {
            (Some(deadline), Some(idle)) if idle.0 < deadline.0 => Some(idle),
            (Some(deadline), _) => Some(deadline),
            (None, idle) => idle,
        }
    }

    async fn release_sender(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            let _ = sender.finish().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Code;
    use crate::transport::memory::stream_pair;
    use crate::transport::StreamPair;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;

    struct MockReceiver {
        pending: VecDeque<Result<Option<Vec<u8>>, RpcError>>,
    }

    #[async_trait]
    impl ReceiveHalf for MockReceiver {
        async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
            match self.pending.pop_front() {
                Some(Ok(Some(chunk))) => Ok(Some(Bytes::from(chunk))),
                Some(Ok(None)) | None => Ok(None),
                Some(Err(err)) => Err(err),
            }
        }
    }

    fn encode(frames: Vec<Frame>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            FrameCodec.encode(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn streaming_from(chunks: Vec<Result<Option<Vec<u8>>, RpcError>>) -> Streaming<String> {
        let reader = FrameReader::new(Box::new(MockReceiver {
            pending: chunks.into(),
        }));
        Streaming::new(reader)
    }

    fn message(text: &str) -> Frame {
        Frame::Message(bincode::serialize(&text.to_string()).unwrap())
    }

    #[tokio::test]
    async fn yields_messages_then_end_of_stream_forever() {
        let wire = encode(vec![message("a"), message("b"), Frame::End, message("late")]);
        let mut inbound = streaming_from(vec![Ok(Some(wire))]);

        assert_eq!(inbound.recv().await.unwrap(), Received::Message("a".into()));
        assert_eq!(inbound.recv().await.unwrap(), Received::Message("b".into()));
        assert_eq!(inbound.recv().await.unwrap(), Received::EndOfStream);
        assert!(inbound.is_terminated());
        // Nothing after the end signal is ever surfaced.
        assert_eq!(inbound.recv().await.unwrap(), Received::EndOfStream);
    }

    #[tokio::test]
    async fn status_frame_becomes_terminal_error() {
        let wire = encode(vec![Frame::Status(Status::invalid_argument("bad"))]);
        let mut inbound = streaming_from(vec![Ok(Some(wire))]);

        let err = inbound.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(inbound.recv().await.is_err());
    }

    #[tokio::test]
    async fn transport_close_without_end_is_an_error() {
        let wire = encode(vec![message("a")]);
        let mut inbound = streaming_from(vec![Ok(Some(wire)), Ok(None)]);

        assert_eq!(inbound.message().await.unwrap(), Some("a".to_string()));
        let err = inbound.recv().await.unwrap_err();
        assert!(matches!(err, RpcError::StreamError(_)));
    }

    #[tokio::test]
    async fn transport_error_is_propagated() {
        let mut inbound =
            streaming_from(vec![Err(RpcError::StreamError("connection reset".into()))]);
        let err = inbound.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_protocol_error() {
        let wire = encode(vec![message("hello")]);
        let mut inbound = streaming_from(vec![Ok(Some(wire[..6].to_vec())), Ok(None)]);
        let err = inbound.recv().await.unwrap_err();
        assert!(matches!(err, RpcError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn cancel_frame_trips_peer_token() {
        let token = CancellationToken::new();
        let wire = encode(vec![Frame::Cancel]);
        let mut inbound = streaming_from(vec![Ok(Some(wire))]).with_peer_cancellation(token.clone());

        let err = inbound.recv().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_interrupts_wait_and_sends_cancel() {
        let (client, server) = stream_pair(4);
        let StreamPair { sender, receiver } = client;
        let mut inbound = Streaming::<String>::new(FrameReader::new(receiver))
            .with_sender(FrameWriter::new(sender))
            .with_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let err = inbound.recv().await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        let mut server_reader = FrameReader::new(server.receiver);
        assert_eq!(server_reader.read().await.unwrap(), Some(Frame::Cancel));
    }

    #[tokio::test]
    async fn caller_cancellation_interrupts_wait() {
        let (client, _server) = stream_pair(4);
        let token = CancellationToken::new();
        let mut inbound = Streaming::<String>::new(FrameReader::new(client.receiver))
            .with_caller_cancellation(Some(token.clone()));

        token.cancel();
        let err = inbound.recv().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn idle_timeout_reports_deadline_exceeded() {
        let (client, _server) = stream_pair(4);
        let mut inbound = Streaming::<String>::new(FrameReader::new(client.receiver))
            .with_idle_timeout(Some(Duration::from_millis(10)));

        let err = inbound.recv().await.unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[tokio::test]
    async fn sink_rejects_messages_after_close() {
        let (client, server) = stream_pair(4);
        let mut sink = RequestSink::<String>::new(FrameWriter::new(client.sender));

        sink.send(&"first".to_string()).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.is_closed());
        assert_eq!(sink.sent(), 1);

        let err = sink.send(&"second".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::StreamError(_)));

        let mut inbound = Streaming::<String>::new(FrameReader::new(server.receiver));
        assert_eq!(inbound.message().await.unwrap(), Some("first".to_string()));
        assert_eq!(inbound.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_string_payload_is_a_message() {
        let wire = encode(vec![message(""), Frame::End]);
        let mut inbound = streaming_from(vec![Ok(Some(wire))]);
        assert_eq!(inbound.recv().await.unwrap(), Received::Message(String::new()));
        assert_eq!(inbound.recv().await.unwrap(), Received::EndOfStream);
    }
}
