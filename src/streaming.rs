//! Client-side coordination of a bidirectional call.
//!
//! The outbound and inbound directions run as two spawned tasks that share
//! nothing but a progress counter. The call completes when the inbound
//! direction ends. A receive failure aborts the send flow. A send that fails
//! because the server already ended the call reports how the server ended
//! it, which may be a normal completion.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::channel::{Received, RequestSink, Streaming};
use crate::errors::RpcError;

/// How long a failed send waits for the receive flow to learn how the server
/// ended the call.
const PEER_OUTCOME_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a coordinated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Open,
    Streaming,
    OutboundClosed,
    InboundClosed,
    Terminated,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }
}

/// Message counts of a completed bidirectional call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BidiSummary {
    pub sent: usize,
    pub received: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StreamCoordinator {
    pacing: Option<Duration>,
}

fn join_failure(flow: &str, err: JoinError) -> RpcError {
    RpcError::InternalError(format!("{flow} flow did not complete: {err}"))
}

/// Outcome of the receive flow after a send broke on the transport. `None`
/// when it has nothing better to report than the send error.
async fn peer_outcome(
    receive_flow: &mut JoinHandle<Result<usize, RpcError>>,
    send_error: &RpcError,
) -> Option<Result<usize, RpcError>> {
    if !send_error.is_transport() {
        return None;
    }
    let outcome = tokio::time::timeout(PEER_OUTCOME_GRACE, receive_flow)
        .await
        .ok()?;
    match outcome.map_err(|e| join_failure("receive", e)).and_then(|r| r) {
        Ok(count) => Some(Ok(count)),
        Err(err) if err.status().is_some() => Some(Err(err)),
        Err(_) => None,
    }
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` between consecutive requests.
    pub fn with_pacing(mut self, delay: Duration) -> Self {
        self.pacing = Some(delay);
        self
    }

    fn transition(state: &mut CallState, next: CallState) {
        debug!(from = ?*state, to = ?next, "bidi call state");
        *state = next;
    }

    /// Sends `requests` in order while delivering every response to
    /// `on_response` in arrival order.
    pub async fn run<Req, Resp, F>(
        &self,
        mut sink: RequestSink<Req>,
        mut responses: Streaming<Resp>,
        requests: Vec<Req>,
        mut on_response: F,
    ) -> Result<BidiSummary, RpcError>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned + Send + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let mut state = CallState::Open;
        let (progress_tx, progress_rx) = watch::channel(0usize);
        let pacing = self.pacing;

        let mut send_flow: JoinHandle<Result<usize, RpcError>> = tokio::spawn(async move {
            let total = requests.len();
            for (index, request) in requests.into_iter().enumerate() {
                sink.send(&request).await?;
                progress_tx.send_replace(sink.sent());
                if let Some(delay) = pacing.filter(|_| index + 1 < total) {
                    tokio::time::sleep(delay).await;
                }
            }
            sink.close().await?;
            Ok(sink.sent())
        });

        let mut receive_flow: JoinHandle<Result<usize, RpcError>> = tokio::spawn(async move {
            let mut received = 0;
            loop {
                match responses.recv().await? {
                    Received::Message(response) => {
                        received += 1;
                        on_response(response);
                    }
                    Received::EndOfStream => return Ok(received),
                }
            }
        });

        Self::transition(&mut state, CallState::Streaming);

        let mut sent = None;
        let received = loop {
            tokio::select! {
                outcome = &mut send_flow, if sent.is_none() => {
                    match outcome.map_err(|e| join_failure("send", e)).and_then(|r| r) {
                        Ok(count) => {
                            sent = Some(count);
                            Self::transition(&mut state, CallState::OutboundClosed);
                        }
                        Err(err) => match peer_outcome(&mut receive_flow, &err).await {
                            Some(Ok(count)) => break count,
                            Some(Err(peer_err)) => {
                                Self::transition(&mut state, CallState::Failed);
                                return Err(peer_err);
                            }
                            None => {
                                receive_flow.abort();
                                Self::transition(&mut state, CallState::Failed);
                                return Err(err);
                            }
                        },
                    }
                }
                outcome = &mut receive_flow => {
                    match outcome.map_err(|e| join_failure("receive", e)).and_then(|r| r) {
                        Ok(count) => break count,
                        Err(err) => {
                            send_flow.abort();
                            Self::transition(&mut state, CallState::Failed);
                            return Err(err);
                        }
                    }
                }
            }
        };
        Self::transition(&mut state, CallState::InboundClosed);

        let sent = match sent {
            Some(count) => count,
            None => {
                // The peer already finished the call.
                send_flow.abort();
                let count = *progress_rx.borrow();
                count
            }
        };
        Self::transition(&mut state, CallState::Terminated);

        Ok(BidiSummary { sent, received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrameReader, FrameWriter};
    use crate::errors::{Code, Status};
    use crate::frame::Frame;
    use crate::transport::memory::stream_pair;
    use crate::transport::StreamPair;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn open_call(capacity: usize) -> (RequestSink<String>, Streaming<String>, StreamPair) {
        let (client, server) = stream_pair(capacity);
        (
            RequestSink::new(FrameWriter::new(client.sender)),
            Streaming::new(FrameReader::new(client.receiver)),
            server,
        )
    }

    /// Answers every request with its uppercase form and mirrors end-of-stream.
    fn spawn_echo_peer(server: StreamPair) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut requests = Streaming::<String>::new(FrameReader::new(server.receiver));
            let mut writer = FrameWriter::new(server.sender);
            let mut seen = Vec::new();
            while let Some(request) = requests.message().await.unwrap() {
                let reply = bincode::serialize(&request.to_uppercase()).unwrap();
                writer.write(Frame::Message(reply)).await.unwrap();
                seen.push(request);
            }
            writer.write(Frame::End).await.unwrap();
            seen
        })
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn responses_arrive_in_order_and_counts_match() {
        let (sink, responses, server) = open_call(4);
        let peer = spawn_echo_peer(server);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = StreamCoordinator::new()
            .run(sink, responses, strings(&["a", "b", "c"]), move |r| {
                let _ = tx.send(r);
            })
            .await
            .unwrap();

        assert_eq!(summary, BidiSummary { sent: 3, received: 3 });
        assert_eq!(peer.await.unwrap(), strings(&["a", "b", "c"]));

        let mut delivered = Vec::new();
        while let Ok(response) = rx.try_recv() {
            delivered.push(response);
        }
        assert_eq!(delivered, strings(&["A", "B", "C"]));
    }

    #[tokio::test]
    async fn empty_request_sequence_completes() {
        let (sink, responses, server) = open_call(4);
        let peer = spawn_echo_peer(server);

        let summary = StreamCoordinator::new()
            .run(sink, responses, Vec::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary, BidiSummary::default());
        assert!(peer.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pacing_spaces_out_requests() {
        let (sink, responses, server) = open_call(4);
        let _peer = spawn_echo_peer(server);
        let started = Instant::now();

        let summary = StreamCoordinator::new()
            .with_pacing(Duration::from_millis(20))
            .run(sink, responses, strings(&["x", "y", "z"]), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.received, 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    fn numbered(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("req{i}")).collect()
    }

    #[tokio::test]
    async fn receive_failure_aborts_the_call() {
        let (sink, responses, server) = open_call(4);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(server.receiver);
            let mut writer = FrameWriter::new(server.sender);
            let _ = reader.read().await;
            writer
                .write(Frame::Status(Status::internal("handler crashed")))
                .await
                .unwrap();
            // Hold the request direction open so only the status ends the call.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = StreamCoordinator::new()
            .with_pacing(Duration::from_millis(50))
            .run(sink, responses, strings(&["a", "b", "c", "d"]), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn server_status_wins_over_broken_send() {
        for _ in 0..20 {
            let (sink, responses, server) = open_call(4);
            tokio::spawn(async move {
                let mut writer = FrameWriter::new(server.sender);
                writer
                    .write(Frame::Status(Status::invalid_argument("rejected")))
                    .await
                    .unwrap();
                drop(server.receiver);
            });

            let err = StreamCoordinator::new()
                .run(sink, responses, numbered(200), |_| {})
                .await
                .unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn early_peer_completion_stops_sending() {
        for _ in 0..20 {
            let (sink, responses, server) = open_call(4);
            tokio::spawn(async move {
                let mut writer = FrameWriter::new(server.sender);
                writer.write(Frame::End).await.unwrap();
                drop(server.receiver);
            });

            let summary = StreamCoordinator::new()
                .run(sink, responses, numbered(200), |_| {})
                .await
                .unwrap();

            assert_eq!(summary.received, 0);
            assert!(summary.sent < 200);
        }
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not encodable"))
        }
    }

    #[tokio::test]
    async fn encoding_failure_does_not_wait_for_the_server() {
        let (client, _server) = stream_pair(4);
        let sink = RequestSink::<Unencodable>::new(FrameWriter::new(client.sender));
        let responses = Streaming::<String>::new(FrameReader::new(client.receiver));

        let coordinator = StreamCoordinator::new();
        let run = coordinator.run(sink, responses, vec![Unencodable], |_| {});
        let err = tokio::time::timeout(Duration::from_millis(300), run)
            .await
            .expect("an encoding failure ends the call at once")
            .unwrap_err();
        assert!(matches!(err, RpcError::SerializationError(_)));
    }

    #[test]
    fn terminal_states() {
        assert!(CallState::Terminated.is_terminal());
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::OutboundClosed.is_terminal());
    }
}
