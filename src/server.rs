use std::{
    collections::HashMap, fs, future::Future, net::SocketAddr, path::Path, sync::Arc,
    time::Duration,
};

use futures::{future::BoxFuture, stream::BoxStream, FutureExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{FrameReader, FrameWriter, Streaming};
use crate::config::RpcConfig;
use crate::context::CallContext;
use crate::errors::{Code, RpcError, Status};
use crate::frame::{CallPattern, Frame};
use crate::transport::{quic, ServerAdapter, ServerConnectionAdapter, StreamPair};

/// Stream of responses produced by a streaming handler.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

type UnaryHandlerFn =
    Box<dyn Fn(CallContext, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, Status>> + Send + Sync>;

type ServerStreamingHandlerFn = Box<
    dyn Fn(CallContext, Vec<u8>) -> BoxFuture<'static, Result<ResponseStream<Vec<u8>>, Status>>
        + Send
        + Sync,
>;

type ClientStreamingHandlerFn = Box<
    dyn Fn(CallContext, FrameReader) -> BoxFuture<'static, Result<Vec<u8>, Status>> + Send + Sync,
>;

type BidiHandlerFn = Box<
    dyn Fn(CallContext, FrameReader) -> BoxFuture<'static, Result<ResponseStream<Vec<u8>>, Status>>
        + Send
        + Sync,
>;

enum MethodHandler {
    Unary(UnaryHandlerFn),
    ServerStreaming(ServerStreamingHandlerFn),
    ClientStreaming(ClientStreamingHandlerFn),
    Bidi(BidiHandlerFn),
}

impl MethodHandler {
    fn pattern(&self) -> CallPattern {
        match self {
            MethodHandler::Unary(_) => CallPattern::Unary,
            MethodHandler::ServerStreaming(_) => CallPattern::ServerStreaming,
            MethodHandler::ClientStreaming(_) => CallPattern::ClientStreaming,
            MethodHandler::Bidi(_) => CallPattern::BidiStreaming,
        }
    }
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<MethodHandler>>>>;

fn decode_request<Req: DeserializeOwned>(params: &[u8]) -> Result<Req, Status> {
    bincode::deserialize(params)
        .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))
}

fn encode_response<Resp: Serialize>(response: &Resp) -> Result<Vec<u8>, Status> {
    bincode::serialize(response)
        .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}

fn encode_stream<S, Resp>(responses: S) -> ResponseStream<Vec<u8>>
where
    S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    responses
        .map(|item| item.and_then(|response| encode_response(&response)))
        .boxed()
}

#[derive(Clone)]
pub struct RpcServer {
    handlers: HandlerMap,

    pub socket_addr: Option<SocketAddr>,

    pub config: RpcConfig,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            socket_addr: None,
            config,
        }
    }

    async fn insert(&self, method: &str, handler: MethodHandler) {
        let mut handlers = self.handlers.write().await;
        if handlers
            .insert(method.to_string(), Arc::new(handler))
            .is_some()
        {
            warn!(method, "replacing an already registered handler");
        }
    }

    pub async fn is_registered(&self, method: &str) -> bool {
        self.handlers.read().await.contains_key(method)
    }

    pub async fn register_unary<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodHandler::Unary(Box::new(
                move |ctx: CallContext, params: Vec<u8>| -> BoxFuture<'static, Result<Vec<u8>, Status>> {
                    let handler = handler.clone();
                    async move {
                        let request: Req = decode_request(&params)?;
                        let response = handler(ctx, request).await?;
                        encode_response(&response)
                    }
                    .boxed()
                },
            )),
        )
        .await;
    }

    pub async fn register_server_streaming<Req, Resp, F, Fut, S>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodHandler::ServerStreaming(Box::new(
                move |ctx: CallContext,
                      params: Vec<u8>|
                      -> BoxFuture<'static, Result<ResponseStream<Vec<u8>>, Status>> {
                    let handler = handler.clone();
                    async move {
                        let request: Req = decode_request(&params)?;
                        let responses = handler(ctx, request).await?;
                        Ok(encode_stream(responses))
                    }
                    .boxed()
                },
            )),
        )
        .await;
    }

    pub async fn register_client_streaming<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodHandler::ClientStreaming(Box::new(
                move |ctx: CallContext, reader: FrameReader| -> BoxFuture<'static, Result<Vec<u8>, Status>> {
                    let handler = handler.clone();
                    async move {
                        let requests = Streaming::new(reader)
                            .with_peer_cancellation(ctx.cancellation_token().clone());
                        let response = handler(ctx, requests).await?;
                        encode_response(&response)
                    }
                    .boxed()
                },
            )),
        )
        .await;
    }

    pub async fn register_bidi_streaming<Req, Resp, F, Fut, S>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodHandler::Bidi(Box::new(
                move |ctx: CallContext,
                      reader: FrameReader|
                      -> BoxFuture<'static, Result<ResponseStream<Vec<u8>>, Status>> {
                    let handler = handler.clone();
                    async move {
                        let requests = Streaming::new(reader)
                            .with_peer_cancellation(ctx.cancellation_token().clone());
                        let responses = handler(ctx, requests).await?;
                        Ok(encode_stream(responses))
                    }
                    .boxed()
                },
            )),
        )
        .await;
    }

    pub async fn start(&mut self, server: quic::QuicServer) -> Result<(), RpcError> {
        let mut adapter = server;
        self.start_with_adapter(&mut adapter).await
    }

    /// Serves every connection accepted by `server` until it stops yielding
    /// connections.
    pub async fn start_with_adapter<A>(&self, server: &mut A) -> Result<(), RpcError>
    where
        A: ServerAdapter + ?Sized,
    {
        while let Some(connection) = server.accept().await {
            let handlers = self.handlers.clone();
            tokio::spawn(Self::serve_connection(handlers, connection));
        }

        Ok(())
    }

    async fn serve_connection(handlers: HandlerMap, mut connection: Box<dyn ServerConnectionAdapter>) {
        loop {
            match connection.accept_stream().await {
                Ok(Some(stream)) => {
                    tokio::spawn(Self::handle_stream(handlers.clone(), stream));
                }
                Ok(None) => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(err) => {
                    debug!("connection failed: {err}");
                    break;
                }
            }
        }
    }

    async fn handle_stream(handlers: HandlerMap, stream: StreamPair) {
        let StreamPair { sender, receiver } = stream;
        let mut writer = FrameWriter::new(sender);
        let reader = FrameReader::new(receiver);

        if let Err(err) = Self::serve_call(&handlers, &mut writer, reader).await {
            debug!("call ended with transport error: {err}");
        }
        let _ = writer.finish().await;
    }

    async fn serve_call(
        handlers: &HandlerMap,
        writer: &mut FrameWriter,
        mut reader: FrameReader,
    ) -> Result<(), RpcError> {
        let (method, pattern, timeout_ms) = match reader.read().await? {
            Some(Frame::Open {
                method,
                pattern,
                timeout_ms,
            }) => (method, pattern, timeout_ms),
            Some(frame) => {
                let status = Status::internal("call did not start with an open frame");
                writer.write(Frame::Status(status)).await?;
                return Err(RpcError::ProtocolError(format!(
                    "expected open frame, got {frame:?}"
                )));
            }
            None => return Ok(()),
        };

        let mut ctx = CallContext::new(&method);
        if let Some(timeout_ms) = timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(timeout_ms));
        }
        debug!(method = %method, pattern = pattern.as_str(), "call opened");

        let handler = handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            let status = Status::unimplemented(format!("unknown method: {method}"));
            return writer.write(Frame::Status(status)).await;
        };
        if handler.pattern() != pattern {
            let status = Status::unimplemented(format!(
                "{method} is a {} call, not {}",
                handler.pattern().as_str(),
                pattern.as_str()
            ));
            return writer.write(Frame::Status(status)).await;
        }

        match handler.as_ref() {
            MethodHandler::Unary(handler) => {
                let request = match Self::read_single_request(&mut reader).await {
                    Ok(request) => request,
                    Err(status) => return writer.write(Frame::Status(status)).await,
                };
                let watcher = Self::watch_for_cancel(reader, ctx.cancellation_token().clone());
                let outcome = handler(ctx, request).await;
                watcher.abort();
                Self::send_single_response(writer, outcome).await
            }
            MethodHandler::ServerStreaming(handler) => {
                let request = match Self::read_single_request(&mut reader).await {
                    Ok(request) => request,
                    Err(status) => return writer.write(Frame::Status(status)).await,
                };
                let watcher = Self::watch_for_cancel(reader, ctx.cancellation_token().clone());
                let result = match handler(ctx.clone(), request).await {
                    Ok(responses) => Self::send_response_stream(writer, responses, &ctx).await,
                    Err(status) => writer.write(Frame::Status(status)).await,
                };
                watcher.abort();
                result
            }
            MethodHandler::ClientStreaming(handler) => {
                let outcome = handler(ctx, reader).await;
                Self::send_single_response(writer, outcome).await
            }
            MethodHandler::Bidi(handler) => match handler(ctx.clone(), reader).await {
                Ok(responses) => Self::send_response_stream(writer, responses, &ctx).await,
                Err(status) => writer.write(Frame::Status(status)).await,
            },
        }
    }

    /// Reads the lone request of a unary or server-streaming call, which must
    /// be followed directly by the client's end-of-stream.
    async fn read_single_request(reader: &mut FrameReader) -> Result<Vec<u8>, Status> {
        let payload = match reader.read().await? {
            Some(Frame::Message(payload)) => payload,
            Some(Frame::Cancel) => return Err(Status::cancelled("the client has canceled the request")),
            Some(Frame::End) => return Err(Status::invalid_argument("call carried no request")),
            Some(frame) => {
                return Err(Status::internal(format!("unexpected frame {frame:?}")))
            }
            None => return Err(Status::unavailable("client closed the stream")),
        };

        match reader.read().await? {
            Some(Frame::End) => Ok(payload),
            Some(Frame::Cancel) => Err(Status::cancelled("the client has canceled the request")),
            Some(Frame::Message(_)) => Err(Status::invalid_argument(
                "call expects exactly one request",
            )),
            Some(frame) => Err(Status::internal(format!("unexpected frame {frame:?}"))),
            None => Err(Status::unavailable("client closed the stream")),
        }
    }

    /// Observes the client direction after its end-of-stream and trips the
    /// call's token when the client cancels or the stream breaks.
    fn watch_for_cancel(mut reader: FrameReader, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            match reader.read().await {
                Ok(None) => {}
                Ok(Some(Frame::Cancel)) => {
                    debug!("client canceled the call");
                    token.cancel();
                }
                Ok(Some(frame)) => {
                    warn!("unexpected frame after end-of-stream: {frame:?}");
                    token.cancel();
                }
                Err(err) => {
                    debug!("client stream failed: {err}");
                    token.cancel();
                }
            }
        })
    }

    async fn send_single_response(
        writer: &mut FrameWriter,
        outcome: Result<Vec<u8>, Status>,
    ) -> Result<(), RpcError> {
        match outcome {
            Ok(response) => {
                writer.write(Frame::Message(response)).await?;
                writer.write(Frame::End).await
            }
            Err(status) => {
                debug!(code = %status.code(), "call failed: {}", status.message());
                writer.write(Frame::Status(status)).await
            }
        }
    }

    /// Forwards `responses` until it ends, fails, or the call is interrupted.
    /// At most one of `End` or `Status` terminates the direction.
    async fn send_response_stream(
        writer: &mut FrameWriter,
        mut responses: ResponseStream<Vec<u8>>,
        ctx: &CallContext,
    ) -> Result<(), RpcError> {
        loop {
            let next = tokio::select! {
                biased;
                status = ctx.done() => return Self::interrupted(writer, status).await,
                next = responses.next() => next,
            };

            let frame = match next {
                Some(Ok(response)) => Frame::Message(response),
                Some(Err(status)) => return writer.write(Frame::Status(status)).await,
                None => return writer.write(Frame::End).await,
            };

            // A client that stopped reading must not pin the call on backpressure.
            let interrupted = tokio::select! {
                biased;
                status = ctx.done() => Some(status),
                written = writer.write(frame) => {
                    written?;
                    None
                }
            };
            if let Some(status) = interrupted {
                return Self::interrupted(writer, status).await;
            }
        }
    }

    /// A canceled call has no reader left; a call past its deadline is told why.
    async fn interrupted(writer: &mut FrameWriter, status: Status) -> Result<(), RpcError> {
        debug!(code = %status.code(), "response stream interrupted");
        if status.code() == Code::Canceled {
            return Ok(());
        }
        writer.write(Frame::Status(status)).await
    }

    pub fn bind(&mut self) -> Result<quic::QuicServer, RpcError> {
        let cert_path = canonicalize_path(&self.config.cert_path)?;
        let key_path =
            self.config.key_path.as_ref().ok_or_else(|| {
                RpcError::ConfigError("Server key path not configured".to_string())
            })?;
        let key_path = canonicalize_path(key_path)?;

        let server = s2n_quic::Server::builder()
            .with_tls((cert_path.as_path(), key_path.as_path()))
            .map_err(|e| RpcError::TlsError(format!("{e:?}")))?
            .with_limits(quic::limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply limits: {e:?}")))?
            .with_io(self.config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{e:?}")))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{e:?}")))?;

        let server = quic::QuicServer::new(server);
        let local_addr = server.local_addr()?;
        self.socket_addr = Some(local_addr);
        info!("RPC server listening on {local_addr}");
        Ok(server)
    }
}

fn canonicalize_path(path: &Path) -> Result<std::path::PathBuf, RpcError> {
    fs::canonicalize(path).map_err(|e| {
        RpcError::ConfigError(format!("Failed to canonicalize {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::stream_pair;
    use futures::stream;

    fn message<T: Serialize>(value: &T) -> Frame {
        Frame::Message(bincode::serialize(value).unwrap())
    }

    fn open(method: &str, pattern: CallPattern) -> Frame {
        Frame::Open {
            method: method.to_string(),
            pattern,
            timeout_ms: None,
        }
    }

    /// Runs one call against `server` and returns everything it wrote back.
    async fn exchange(server: &RpcServer, frames: Vec<Frame>) -> Vec<Frame> {
        let (client, server_side) = stream_pair(16);
        let task = tokio::spawn(RpcServer::handle_stream(server.handlers.clone(), server_side));

        let mut writer = FrameWriter::new(client.sender);
        for frame in frames {
            writer.write(frame).await.unwrap();
        }

        let mut reader = FrameReader::new(client.receiver);
        let mut received = Vec::new();
        while let Some(frame) = reader.read().await.unwrap() {
            received.push(frame);
        }
        drop(writer);
        task.await.unwrap();
        received
    }

    async fn echo_server() -> RpcServer {
        let server = RpcServer::new(RpcConfig::in_memory());
        server
            .register_unary("echo", |_ctx, text: String| async move { Ok(text) })
            .await;
        server
            .register_server_streaming("count", |_ctx, n: u32| async move {
                Ok(stream::iter((0..n).map(Ok)))
            })
            .await;
        server
    }

    #[tokio::test]
    async fn unary_call_writes_message_then_end() {
        let server = echo_server().await;
        let received = exchange(
            &server,
            vec![open("echo", CallPattern::Unary), message(&"hi".to_string()), Frame::End],
        )
        .await;
        assert_eq!(received, vec![message(&"hi".to_string()), Frame::End]);
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let server = echo_server().await;
        let received = exchange(&server, vec![open("nope", CallPattern::Unary)]).await;
        match received.as_slice() {
            [Frame::Status(status)] => assert_eq!(status.code(), Code::Unimplemented),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pattern_mismatch_is_unimplemented() {
        let server = echo_server().await;
        let received = exchange(&server, vec![open("echo", CallPattern::BidiStreaming)]).await;
        match received.as_slice() {
            [Frame::Status(status)] => {
                assert_eq!(status.code(), Code::Unimplemented);
                assert!(status.message().contains("unary"));
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unary_rejects_second_request() {
        let server = echo_server().await;
        let received = exchange(
            &server,
            vec![
                open("echo", CallPattern::Unary),
                message(&"a".to_string()),
                message(&"b".to_string()),
            ],
        )
        .await;
        match received.as_slice() {
            [Frame::Status(status)] => assert_eq!(status.code(), Code::InvalidArgument),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_request_is_invalid_argument() {
        let server = echo_server().await;
        let received = exchange(
            &server,
            vec![open("count", CallPattern::ServerStreaming), Frame::Message(vec![1]), Frame::End],
        )
        .await;
        match received.as_slice() {
            [Frame::Status(status)] => assert_eq!(status.code(), Code::InvalidArgument),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_stream_ends_after_last_item() {
        let server = echo_server().await;
        let received = exchange(
            &server,
            vec![open("count", CallPattern::ServerStreaming), message(&3u32), Frame::End],
        )
        .await;
        assert_eq!(
            received,
            vec![message(&0u32), message(&1u32), message(&2u32), Frame::End]
        );
    }

    #[tokio::test]
    async fn stream_error_item_terminates_with_status() {
        let server = RpcServer::new(RpcConfig::in_memory());
        server
            .register_server_streaming("flaky", |_ctx, _req: ()| async move {
                Ok(stream::iter(vec![
                    Ok(1u8),
                    Err(Status::internal("boom")),
                    Ok(2u8),
                ]))
            })
            .await;

        let received = exchange(
            &server,
            vec![open("flaky", CallPattern::ServerStreaming), message(&()), Frame::End],
        )
        .await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], message(&1u8));
        assert!(matches!(&received[1], Frame::Status(s) if s.code() == Code::Internal));
    }

    #[tokio::test]
    async fn first_frame_must_be_open() {
        let server = echo_server().await;
        let received = exchange(&server, vec![Frame::End]).await;
        match received.as_slice() {
            [Frame::Status(status)] => assert_eq!(status.code(), Code::Internal),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_frame_reaches_unary_handler() {
        let server = RpcServer::new(RpcConfig::in_memory());
        server
            .register_unary("wait", |ctx: CallContext, _req: ()| async move {
                Err::<(), _>(ctx.done().await)
            })
            .await;

        let received = exchange(
            &server,
            vec![
                open("wait", CallPattern::Unary),
                message(&()),
                Frame::End,
                Frame::Cancel,
            ],
        )
        .await;
        match received.as_slice() {
            [Frame::Status(status)] => assert_eq!(status.code(), Code::Canceled),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn registration_is_visible() {
        let server = echo_server().await;
        assert!(server.is_registered("echo").await);
        assert!(!server.is_registered("missing").await);
    }
}
