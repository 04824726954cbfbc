//! Streaming RPC over QUIC with four call shapes: unary, server-streaming,
//! client-streaming and bidirectional streaming.
//!
//! A call occupies one bidirectional transport stream. The client opens it
//! with an [`frame::Frame::Open`] frame naming the method and pattern, then
//! each direction carries messages followed by its own explicit
//! end-of-stream, or a terminal status from the server.
//!
//! The [`greet`] module is a complete service built on these pieces.

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod frame;
pub mod greet;
pub mod server;
pub mod streaming;
pub mod transport;

pub mod runtime {
    //! Helpers for configuring Tokio runtimes.
    use std::{env, io, thread};

    /// Environment variable that controls the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "GREETNET_SERVER_THREADS";

    /// Returns the worker thread count derived from [`SERVER_THREADS_ENV`],
    /// falling back to the number of available CPU threads.
    pub fn server_worker_threads() -> usize {
        threads_from_env(SERVER_THREADS_ENV).unwrap_or_else(default_worker_threads)
    }

    /// Parses an environment variable as a positive worker-thread count.
    pub fn threads_from_env(key: &str) -> Option<usize> {
        let raw = env::var(key).ok()?;
        parse_threads(&raw)
    }

    /// Multi-threaded runtime sized by [`server_worker_threads`].
    pub fn server_runtime() -> io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server_worker_threads())
            .thread_name("greetnet-server")
            .enable_all()
            .build()
    }

    fn default_worker_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn parse_threads(raw: &str) -> Option<usize> {
        let value = raw.trim().parse::<usize>().ok()?;
        (value > 0).then_some(value)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_threads_rejects_invalid_values() {
            assert_eq!(parse_threads("0"), None);
            assert_eq!(parse_threads("-1"), None);
            assert_eq!(parse_threads("abc"), None);
        }

        #[test]
        fn parse_threads_accepts_positive_values() {
            assert_eq!(parse_threads("8"), Some(8));
            assert_eq!(parse_threads(" 4 "), Some(4));
        }

        #[test]
        fn unset_variable_yields_none() {
            assert_eq!(threads_from_env("GREETNET_TEST_UNSET_THREADS"), None);
            assert!(server_worker_threads() >= 1);
        }
    }
}

pub use channel::{Received, RequestSink, Streaming};
pub use client::{CallOptions, ClientStreamingCall, RpcClient};
pub use config::RpcConfig;
pub use context::CallContext;
pub use errors::{Code, RpcError, Status};
pub use frame::CallPattern;
pub use server::{ResponseStream, RpcServer};
pub use streaming::{BidiSummary, CallState, StreamCoordinator};
