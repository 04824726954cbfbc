use async_trait::async_trait;
use bytes::Bytes;
use s2n_quic::stream::{ReceiveStream, SendStream};

use super::{
    ConnectionAdapter, ReceiveHalf, SendHalf, ServerAdapter, ServerConnectionAdapter, StreamPair,
};
use crate::errors::RpcError;

#[async_trait]
impl SendHalf for SendStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.send(data)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn finish(&mut self) -> Result<(), RpcError> {
        SendStream::finish(self).map_err(|err| RpcError::StreamError(err.to_string()))
    }
}

#[async_trait]
impl ReceiveHalf for ReceiveStream {
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.receive()
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }
}

fn split(stream: s2n_quic::stream::BidirectionalStream) -> StreamPair {
    let (receiver, sender) = stream.split();
    StreamPair::new(Box::new(sender), Box::new(receiver))
}

pub(crate) struct QuicConnection {
    inner: s2n_quic::Connection,
}

impl QuicConnection {
    pub(crate) fn new(inner: s2n_quic::Connection) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ConnectionAdapter for QuicConnection {
    async fn open_stream(&mut self) -> Result<StreamPair, RpcError> {
        let stream = self
            .inner
            .open_bidirectional_stream()
            .await
            .map_err(|e| RpcError::StreamError(e.to_string()))?;
        Ok(split(stream))
    }
}

pub(crate) struct QuicServerConnection {
    inner: s2n_quic::Connection,
}

#[async_trait]
impl ServerConnectionAdapter for QuicServerConnection {
    async fn accept_stream(&mut self) -> Result<Option<StreamPair>, RpcError> {
        match self.inner.accept_bidirectional_stream().await {
            Ok(Some(stream)) => Ok(Some(split(stream))),
            Ok(None) => Ok(None),
            Err(e) => Err(RpcError::StreamError(e.to_string())),
        }
    }
}

pub struct QuicServer {
    inner: s2n_quic::Server,
}

impl QuicServer {
    pub(crate) fn new(inner: s2n_quic::Server) -> Self {
        Self { inner }
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, RpcError> {
        self.inner
            .local_addr()
            .map_err(|e| RpcError::ConfigError(format!("local_addr unavailable: {e:?}")))
    }
}

#[async_trait]
impl ServerAdapter for QuicServer {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>> {
        self.inner
            .accept()
            .await
            .map(|connection| Box::new(QuicServerConnection { inner: connection }) as _)
    }
}

pub(crate) fn limits() -> Result<s2n_quic::provider::limits::Limits, RpcError> {
    s2n_quic::provider::limits::Limits::new()
        .with_max_open_local_bidirectional_streams(10_000)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {e:?}")))?
        .with_max_open_remote_bidirectional_streams(10_000)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {e:?}")))?
        .with_data_window(16 * 1024 * 1024)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set data window: {e:?}")))?
        .with_bidirectional_local_data_window(8 * 1024 * 1024)
        .map_err(|e| {
            RpcError::ConfigError(format!("Failed to set bidirectional window: {e:?}"))
        })
}
