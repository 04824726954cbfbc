//! In-process transport backed by bounded tokio channels.
//!
//! Each direction of a stream is an `mpsc` channel of byte chunks, so sends
//! apply backpressure once `capacity` chunks are queued, and dropping or
//! finishing a send half is seen by the receiver as end of input.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    ConnectionAdapter, ReceiveHalf, SendHalf, ServerAdapter, ServerConnectionAdapter, StreamPair,
};
use crate::errors::RpcError;

/// Creates a connector/listener pair sharing one in-process "network".
pub fn listener(capacity: usize) -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let capacity = capacity.max(1);
    (
        MemoryConnector {
            connections: tx,
            capacity,
        },
        MemoryListener { connections: rx },
    )
}

/// Creates the two halves of a single in-process stream.
pub fn stream_pair(capacity: usize) -> (StreamPair, StreamPair) {
    let capacity = capacity.max(1);
    let (client_tx, server_rx) = mpsc::channel(capacity);
    let (server_tx, client_rx) = mpsc::channel(capacity);
    (
        StreamPair::new(
            Box::new(MemorySendHalf::new(client_tx)),
            Box::new(MemoryReceiveHalf { rx: client_rx }),
        ),
        StreamPair::new(
            Box::new(MemorySendHalf::new(server_tx)),
            Box::new(MemoryReceiveHalf { rx: server_rx }),
        ),
    )
}

pub struct MemorySendHalf {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl MemorySendHalf {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl SendHalf for MemorySendHalf {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RpcError::StreamError("send half already finished".into()))?;
        tx.send(data)
            .await
            .map_err(|_| RpcError::StreamError("peer stopped receiving".into()))
    }

    async fn finish(&mut self) -> Result<(), RpcError> {
        self.tx.take();
        Ok(())
    }
}

pub struct MemoryReceiveHalf {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl ReceiveHalf for MemoryReceiveHalf {
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        Ok(self.rx.recv().await)
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    connections: mpsc::UnboundedSender<MemoryServerConnection>,
    capacity: usize,
}

impl MemoryConnector {
    pub fn connect(&self) -> Result<MemoryConnection, RpcError> {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        self.connections
            .send(MemoryServerConnection {
                streams: streams_rx,
            })
            .map_err(|_| RpcError::ConnectionError("memory listener is closed".into()))?;
        Ok(MemoryConnection {
            streams: streams_tx,
            capacity: self.capacity,
        })
    }
}

pub struct MemoryConnection {
    streams: mpsc::UnboundedSender<StreamPair>,
    capacity: usize,
}

#[async_trait]
impl ConnectionAdapter for MemoryConnection {
    async fn open_stream(&mut self) -> Result<StreamPair, RpcError> {
        let (client, server) = stream_pair(self.capacity);
        self.streams
            .send(server)
            .map_err(|_| RpcError::ConnectionError("memory connection is closed".into()))?;
        Ok(client)
    }
}

pub struct MemoryServerConnection {
    streams: mpsc::UnboundedReceiver<StreamPair>,
}

#[async_trait]
impl ServerConnectionAdapter for MemoryServerConnection {
    async fn accept_stream(&mut self) -> Result<Option<StreamPair>, RpcError> {
        Ok(self.streams.recv().await)
    }
}

pub struct MemoryListener {
    connections: mpsc::UnboundedReceiver<MemoryServerConnection>,
}

#[async_trait]
impl ServerAdapter for MemoryListener {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>> {
        self.connections
            .recv()
            .await
            .map(|connection| Box::new(connection) as _)
    }
}
