use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::methods;
use super::types::*;
use crate::channel::{Received, Streaming};
use crate::config::RpcConfig;
use crate::context::CallContext;
use crate::errors::{RpcError, Status};
use crate::server::{ResponseStream, RpcServer};
use crate::transport::ServerAdapter;

/// Number of responses produced by `GreetManyTimes`.
pub const GREET_MANY_TIMES_COUNT: usize = 10;

/// Handler trait implemented by the service's business logic.
#[async_trait]
pub trait GreetHandler: Send + Sync + 'static {
    async fn greet(&self, ctx: CallContext, request: GreetRequest)
        -> Result<GreetResponse, Status>;

    async fn greet_many_times(
        &self,
        ctx: CallContext,
        request: GreetManyTimesRequest,
    ) -> Result<ResponseStream<GreetManyTimesResponse>, Status>;

    async fn long_greet(
        &self,
        ctx: CallContext,
        requests: Streaming<LongGreetRequest>,
    ) -> Result<LongGreetResponse, Status>;

    async fn greet_everyone(
        &self,
        ctx: CallContext,
        requests: Streaming<GreetEveryoneRequest>,
    ) -> Result<ResponseStream<GreetEveryoneResponse>, Status>;

    async fn square_root(
        &self,
        ctx: CallContext,
        request: SquareRootRequest,
    ) -> Result<SquareRootResponse, Status>;
}

/// "Hello {first} {last}", keeping the separator when there is no last name.
fn full_greeting(greeting: &Greeting) -> String {
    format!(
        "Hello {} {}",
        greeting.first_name,
        greeting.last_name.as_deref().unwrap_or_default()
    )
}

/// Stateless implementation of [`GreetHandler`].
#[derive(Debug, Clone)]
pub struct GreetService {
    pacing: Option<Duration>,
    latency: Option<Duration>,
    count: usize,
}

impl Default for GreetService {
    fn default() -> Self {
        Self {
            pacing: None,
            latency: None,
            count: GREET_MANY_TIMES_COUNT,
        }
    }
}

impl GreetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay between consecutive `GreetManyTimes` responses.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Time `Greet` spends before checking the call and answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl GreetHandler for GreetService {
    async fn greet(
        &self,
        ctx: CallContext,
        request: GreetRequest,
    ) -> Result<GreetResponse, Status> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Err(status) = ctx.check() {
            debug!(code = %status.code(), "greet abandoned before work");
            return Err(status);
        }

        Ok(GreetResponse {
            result: full_greeting(&request.greeting),
        })
    }

    async fn greet_many_times(
        &self,
        _ctx: CallContext,
        request: GreetManyTimesRequest,
    ) -> Result<ResponseStream<GreetManyTimesResponse>, Status> {
        let first_name = request.greeting.first_name;
        let pacing = self.pacing;
        let count = self.count;

        Ok(async_stream::stream! {
            for i in 0..count {
                if i > 0 {
                    if let Some(pacing) = pacing {
                        tokio::time::sleep(pacing).await;
                    }
                }
                yield Ok::<_, Status>(GreetManyTimesResponse {
                    result: format!("Hello {first_name} number {i}"),
                });
            }
        }
        .boxed())
    }

    async fn long_greet(
        &self,
        _ctx: CallContext,
        mut requests: Streaming<LongGreetRequest>,
    ) -> Result<LongGreetResponse, Status> {
        let mut result = String::new();
        while let Some(request) = requests.message().await? {
            result.push_str(&request.greeting.first_name);
            result.push_str("! ");
        }
        Ok(LongGreetResponse { result })
    }

    async fn greet_everyone(
        &self,
        _ctx: CallContext,
        mut requests: Streaming<GreetEveryoneRequest>,
    ) -> Result<ResponseStream<GreetEveryoneResponse>, Status> {
        Ok(async_stream::stream! {
            loop {
                match requests.recv().await {
                    Ok(Received::Message(request)) => {
                        yield Ok::<_, Status>(GreetEveryoneResponse {
                            result: format!("Hello {}", request.greeting.first_name),
                        });
                    }
                    Ok(Received::EndOfStream) => break,
                    Err(err) => {
                        yield Err(Status::from(err));
                        break;
                    }
                }
            }
        }
        .boxed())
    }

    async fn square_root(
        &self,
        _ctx: CallContext,
        request: SquareRootRequest,
    ) -> Result<SquareRootResponse, Status> {
        let number = request.number;
        if number < 0 {
            return Err(Status::invalid_argument(format!(
                "Received a negative number: {number}"
            )));
        }
        Ok(SquareRootResponse {
            root: f64::from(number).sqrt(),
        })
    }
}

/// Binds a [`GreetHandler`] to an [`RpcServer`].
pub struct GreetServer<H: GreetHandler> {
    handler: Arc<H>,
    rpc_server: RpcServer,
}

impl<H: GreetHandler> GreetServer<H> {
    pub fn new(handler: H, config: RpcConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            rpc_server: RpcServer::new(config),
        }
    }

    pub fn rpc_server(&self) -> &RpcServer {
        &self.rpc_server
    }

    /// Registers every greet method with the RPC server.
    pub async fn register_all(&self) {
        let server = &self.rpc_server;

        let handler = self.handler.clone();
        server
            .register_unary(methods::GREET, move |ctx, request: GreetRequest| {
                let handler = handler.clone();
                async move { handler.greet(ctx, request).await }
            })
            .await;

        let handler = self.handler.clone();
        server
            .register_server_streaming(
                methods::GREET_MANY_TIMES,
                move |ctx, request: GreetManyTimesRequest| {
                    let handler = handler.clone();
                    async move { handler.greet_many_times(ctx, request).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        server
            .register_client_streaming(
                methods::LONG_GREET,
                move |ctx, requests: Streaming<LongGreetRequest>| {
                    let handler = handler.clone();
                    async move { handler.long_greet(ctx, requests).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        server
            .register_bidi_streaming(
                methods::GREET_EVERYONE,
                move |ctx, requests: Streaming<GreetEveryoneRequest>| {
                    let handler = handler.clone();
                    async move { handler.greet_everyone(ctx, requests).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        server
            .register_unary(methods::SQUARE_ROOT, move |ctx, request: SquareRootRequest| {
                let handler = handler.clone();
                async move { handler.square_root(ctx, request).await }
            })
            .await;
    }

    /// Registers the service and serves connections from `adapter`.
    pub async fn serve_with_adapter<A>(self, adapter: &mut A) -> Result<(), RpcError>
    where
        A: ServerAdapter + ?Sized,
    {
        self.register_all().await;
        self.rpc_server.start_with_adapter(adapter).await
    }

    /// Registers the service, binds the QUIC endpoint and serves until it closes.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        self.register_all().await;
        let quic_server = self.rpc_server.bind()?;
        info!(addr = ?self.rpc_server.socket_addr, "greet service ready");
        self.rpc_server.start(quic_server).await
    }
}
