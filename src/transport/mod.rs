//! Byte-level transport adapters.
//!
//! Every call runs on its own bidirectional stream, split into independent
//! send and receive halves so that a bidi call can drive both directions from
//! separate tasks.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::RpcError;

pub mod memory;
pub mod quic;

#[async_trait]
pub trait SendHalf: Send {
    /// Waits until the transport accepts `data`.
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError>;

    /// Gracefully closes this direction of the stream.
    async fn finish(&mut self) -> Result<(), RpcError>;
}

#[async_trait]
pub trait ReceiveHalf: Send {
    /// Returns `Ok(None)` once the peer has closed its direction.
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError>;
}

#[async_trait]
impl<T> SendHalf for Box<T>
where
    T: SendHalf + ?Sized,
{
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        (**self).send_bytes(data).await
    }

    async fn finish(&mut self) -> Result<(), RpcError> {
        (**self).finish().await
    }
}

#[async_trait]
impl<T> ReceiveHalf for Box<T>
where
    T: ReceiveHalf + ?Sized,
{
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        (**self).receive_bytes().await
    }
}

/// Both halves of one call's stream.
pub struct StreamPair {
    pub sender: Box<dyn SendHalf>,
    pub receiver: Box<dyn ReceiveHalf>,
}

impl StreamPair {
    pub fn new(sender: Box<dyn SendHalf>, receiver: Box<dyn ReceiveHalf>) -> Self {
        Self { sender, receiver }
    }
}

/// Client side of a connection: opens one stream per call.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    async fn open_stream(&mut self) -> Result<StreamPair, RpcError>;
}

/// Server side of a connection: yields the streams opened by the client.
#[async_trait]
pub trait ServerConnectionAdapter: Send {
    async fn accept_stream(&mut self) -> Result<Option<StreamPair>, RpcError>;
}

#[async_trait]
pub trait ServerAdapter: Send {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>>;
}
