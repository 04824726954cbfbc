use std::{marker::PhantomData, net::SocketAddr, sync::Arc, time::Duration};

use s2n_quic::{client::Connect, Client};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{FrameReader, FrameWriter, Received, RequestSink, Streaming};
use crate::config::RpcConfig;
use crate::errors::{RpcError, Status};
use crate::frame::{CallPattern, Frame};
use crate::transport::{quic, ConnectionAdapter, StreamPair};

/// Per-call settings chosen by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the call with `DeadlineExceeded` once `timeout` has elapsed
    /// since the call was opened.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fails the call with `Canceled` once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn check(&self, deadline: Option<Instant>) -> Result<(), RpcError> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Status::deadline_exceeded("deadline exceeded").into());
        }
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(Status::cancelled("the call was canceled by the caller").into());
        }
        Ok(())
    }
}

struct OpenCall {
    writer: FrameWriter,
    reader: FrameReader,
    deadline: Option<Instant>,
}

#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<RwLock<Box<dyn ConnectionAdapter>>>,
    config: RpcConfig,
}

impl RpcClient {
    pub async fn connect(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let client = Client::builder()
            .with_tls(config.cert_path.as_path())
            .map_err(|e| RpcError::TlsError(format!("{e:?}")))?
            .with_limits(quic::limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply client limits: {e:?}")))?
            .with_io(config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{e:?}")))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{e:?}")))?;

        let connect = Connect::new(connect_addr).with_server_name(config.server_name.as_str());
        let mut connection = client
            .connect(connect)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;

        if config.keep_alive_interval.is_some() {
            connection
                .keep_alive(true)
                .map_err(|e| RpcError::ConfigError(e.to_string()))?;
        }
        debug!("connected to {connect_addr}");

        Ok(Self::with_connection(
            quic::QuicConnection::new(connection),
            config,
        ))
    }

    /// Builds a client over an already established connection, such as one
    /// from [`crate::transport::memory::listener`].
    pub fn with_connection<C>(connection: C, config: RpcConfig) -> Self
    where
        C: ConnectionAdapter + 'static,
    {
        Self {
            connection: Arc::new(RwLock::new(Box::new(connection))),
            config,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    async fn open_call(
        &self,
        method: &str,
        pattern: CallPattern,
        options: &CallOptions,
    ) -> Result<OpenCall, RpcError> {
        let deadline = options
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        options.check(deadline)?;

        let StreamPair { sender, receiver } = {
            let mut connection = self.connection.write().await;
            connection.open_stream().await?
        };

        let mut writer = FrameWriter::new(sender);
        writer
            .write(Frame::Open {
                method: method.to_string(),
                pattern,
                timeout_ms: options
                    .timeout
                    .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            })
            .await?;
        debug!(method, pattern = pattern.as_str(), "call opened");

        Ok(OpenCall {
            writer,
            reader: FrameReader::new(receiver),
            deadline,
        })
    }

    /// Sends the single request of a unary or server-streaming call followed
    /// by end-of-stream.
    async fn send_single<Req: Serialize>(
        writer: &mut FrameWriter,
        request: &Req,
    ) -> Result<(), RpcError> {
        let payload = bincode::serialize(request)?;
        writer.write(Frame::Message(payload)).await?;
        writer.write(Frame::End).await
    }

    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let OpenCall {
            mut writer,
            reader,
            deadline,
        } = self.open_call(method, CallPattern::Unary, &options).await?;
        if let Err(err) = Self::send_single(&mut writer, request).await {
            return Err(terminal_status(reader).await.unwrap_or(err));
        }

        let mut response = Streaming::<Resp>::new(reader)
            .with_sender(writer)
            .with_deadline(deadline)
            .with_caller_cancellation(options.cancellation);
        receive_single(&mut response).await
    }

    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Streaming<Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let OpenCall {
            mut writer,
            reader,
            deadline,
        } = self
            .open_call(method, CallPattern::ServerStreaming, &options)
            .await?;
        if let Err(err) = Self::send_single(&mut writer, request).await {
            return Err(terminal_status(reader).await.unwrap_or(err));
        }

        Ok(Streaming::new(reader)
            .with_sender(writer)
            .with_deadline(deadline)
            .with_idle_timeout(self.config.default_stream_timeout)
            .with_caller_cancellation(options.cancellation))
    }

    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<Req, Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let OpenCall {
            writer,
            reader,
            deadline,
        } = self
            .open_call(method, CallPattern::ClientStreaming, &options)
            .await?;

        Ok(ClientStreamingCall {
            sink: RequestSink::new(writer),
            response: Streaming::new(reader)
                .with_deadline(deadline)
                .with_idle_timeout(self.config.default_stream_timeout)
                .with_caller_cancellation(options.cancellation.clone()),
            options,
            deadline,
            finished: None,
            _marker: PhantomData,
        })
    }

    /// Opens a bidirectional call. Both halves may be moved to separate tasks.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<(RequestSink<Req>, Streaming<Resp>), RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let OpenCall {
            writer,
            reader,
            deadline,
        } = self
            .open_call(method, CallPattern::BidiStreaming, &options)
            .await?;

        let responses = Streaming::new(reader)
            .with_deadline(deadline)
            .with_idle_timeout(self.config.default_stream_timeout)
            .with_caller_cancellation(options.cancellation);
        Ok((RequestSink::new(writer), responses))
    }
}

/// A send fails when the server has already finished the call; its terminal
/// status, if one arrived, explains why.
async fn terminal_status(mut reader: FrameReader) -> Option<RpcError> {
    match reader.read().await {
        Ok(Some(Frame::Status(status))) => Some(status.into()),
        _ => None,
    }
}

/// Reads exactly one response followed by end-of-stream.
async fn receive_single<Resp: DeserializeOwned>(
    inbound: &mut Streaming<Resp>,
) -> Result<Resp, RpcError> {
    let response = match inbound.recv().await? {
        Received::Message(response) => response,
        Received::EndOfStream => {
            return Err(RpcError::ProtocolError(
                "call ended without a response".into(),
            ))
        }
    };
    match inbound.recv().await? {
        Received::EndOfStream => Ok(response),
        Received::Message(_) => Err(RpcError::ProtocolError(
            "call returned more than one response".into(),
        )),
    }
}

/// Client half of a client-streaming call.
pub struct ClientStreamingCall<Req, Resp> {
    sink: RequestSink<Req>,
    response: Streaming<Resp>,
    options: CallOptions,
    deadline: Option<Instant>,
    /// What the server answered when it ended the call before the last send.
    finished: Option<Result<Resp, RpcError>>,
    _marker: PhantomData<fn(Req)>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    /// Sends one request. Once the server has ended the call, fails with the
    /// server's status if it sent one.
    pub async fn send(&mut self, request: &Req) -> Result<(), RpcError> {
        if self.finished.is_some() {
            return Err(RpcError::StreamError(
                "the server already finished the call".into(),
            ));
        }
        if let Err(err) = self.options.check(self.deadline) {
            let _ = self.sink.cancel().await;
            return Err(err);
        }

        let was_open = !self.sink.is_closed();
        match self.sink.send(request).await {
            Err(err) if was_open && err.is_transport() => Err(self.server_finished(err).await),
            outcome => outcome,
        }
    }

    pub fn sent(&self) -> usize {
        self.sink.sent()
    }

    /// Closes the outbound direction and waits for the single response.
    pub async fn close_and_recv(mut self) -> Result<Resp, RpcError> {
        if let Some(outcome) = self.finished.take() {
            return outcome;
        }
        if let Err(err) = self.sink.close().await {
            if !err.is_transport() {
                return Err(err);
            }
            return match receive_single(&mut self.response).await {
                Ok(response) => Ok(response),
                Err(failure) if failure.status().is_some() => Err(failure),
                Err(_) => Err(err),
            };
        }

        let outcome = receive_single(&mut self.response).await;
        if let Err(err) = &outcome {
            if err.is_deadline_exceeded() || err.is_cancelled() {
                let _ = self.sink.cancel().await;
            }
        }
        outcome
    }

    /// Abandons the call.
    pub async fn cancel(mut self) -> Result<(), RpcError> {
        self.sink.cancel().await
    }

    /// Records the server's answer after a write failed because the server
    /// stopped reading, and picks the error to report for that write.
    async fn server_finished(&mut self, err: RpcError) -> RpcError {
        let outcome = receive_single(&mut self.response).await;
        let reported = match &outcome {
            Err(failure) => failure.status().cloned().map(RpcError::from),
            Ok(_) => None,
        };
        self.finished = Some(outcome);
        reported.unwrap_or(err)
    }
}
