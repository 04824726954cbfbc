//! Greet service over QUIC.
//!
//! Expects `certs/test_cert.pem` and `certs/test_key.pem`. The listen address
//! may be given as the first argument; worker threads follow
//! `GREETNET_SERVER_THREADS`.

use std::time::Duration;

use greetnet::greet::{GreetServer, GreetService};
use greetnet::{runtime, RpcConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bind_address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:50051".to_string());

    let config = RpcConfig::new("certs/test_cert.pem", bind_address)
        .with_key_path("certs/test_key.pem")
        .with_server_name("localhost");

    // Slow enough to let a client exercise GreetManyTimes pacing.
    let service = GreetService::new().with_pacing(Duration::from_millis(500));

    let rt = runtime::server_runtime()?;
    tracing::info!(
        threads = runtime::server_worker_threads(),
        "starting greet server"
    );
    rt.block_on(GreetServer::new(service, config).serve())?;
    Ok(())
}
