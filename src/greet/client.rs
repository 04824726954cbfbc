use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use super::methods;
use super::types::*;
use crate::channel::Streaming;
use crate::client::{CallOptions, RpcClient};
use crate::config::RpcConfig;
use crate::errors::RpcError;
use crate::streaming::{BidiSummary, StreamCoordinator};

/// Typed driver for the greet service.
#[derive(Clone)]
pub struct GreetClient {
    inner: RpcClient,
}

impl GreetClient {
    pub async fn connect(addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let inner = RpcClient::connect(addr, config).await?;
        Ok(Self { inner })
    }

    pub fn new(inner: RpcClient) -> Self {
        Self { inner }
    }

    pub fn rpc_client(&self) -> &RpcClient {
        &self.inner
    }

    pub async fn greet(
        &self,
        greeting: Greeting,
        options: CallOptions,
    ) -> Result<GreetResponse, RpcError> {
        self.inner
            .unary(methods::GREET, &GreetRequest { greeting }, options)
            .await
    }

    /// Starts `GreetManyTimes`; read the returned stream until end-of-stream.
    pub async fn greet_many_times(
        &self,
        greeting: Greeting,
        options: CallOptions,
    ) -> Result<Streaming<GreetManyTimesResponse>, RpcError> {
        self.inner
            .server_streaming(
                methods::GREET_MANY_TIMES,
                &GreetManyTimesRequest { greeting },
                options,
            )
            .await
    }

    /// Sends every greeting, optionally `pacing` apart, then closes and
    /// waits for the combined response.
    pub async fn long_greet(
        &self,
        greetings: Vec<Greeting>,
        pacing: Option<Duration>,
        options: CallOptions,
    ) -> Result<LongGreetResponse, RpcError> {
        let mut call = self
            .inner
            .client_streaming::<LongGreetRequest, LongGreetResponse>(methods::LONG_GREET, options)
            .await?;

        let total = greetings.len();
        for (index, greeting) in greetings.into_iter().enumerate() {
            debug!(first_name = %greeting.first_name, "sending long greet request");
            call.send(&LongGreetRequest { greeting }).await?;
            if let Some(delay) = pacing.filter(|_| index + 1 < total) {
                tokio::time::sleep(delay).await;
            }
        }

        call.close_and_recv().await
    }

    /// Runs `GreetEveryone` through `coordinator`, handing each response to
    /// `on_response` as it arrives.
    pub async fn greet_everyone<F>(
        &self,
        greetings: Vec<Greeting>,
        coordinator: &StreamCoordinator,
        options: CallOptions,
        on_response: F,
    ) -> Result<BidiSummary, RpcError>
    where
        F: FnMut(GreetEveryoneResponse) + Send + 'static,
    {
        let (sink, responses) = self
            .inner
            .bidi_streaming::<GreetEveryoneRequest, GreetEveryoneResponse>(
                methods::GREET_EVERYONE,
                options,
            )
            .await?;

        let requests = greetings
            .into_iter()
            .map(|greeting| GreetEveryoneRequest { greeting })
            .collect();
        coordinator
            .run(sink, responses, requests, on_response)
            .await
    }

    pub async fn square_root(
        &self,
        number: i32,
        options: CallOptions,
    ) -> Result<SquareRootResponse, RpcError> {
        self.inner
            .unary(methods::SQUARE_ROOT, &SquareRootRequest { number }, options)
            .await
    }
}
