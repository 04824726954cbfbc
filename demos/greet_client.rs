//! Drives every greet method against a running `greet_server`.

use std::net::SocketAddr;
use std::time::Duration;

use greetnet::greet::{GreetClient, Greeting};
use greetnet::{CallOptions, RpcConfig, StreamCoordinator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let server_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:50051".to_string())
        .parse()?;
    let config = RpcConfig::new("certs/test_cert.pem", "127.0.0.1:0").with_server_name("localhost");

    let client = GreetClient::connect(server_addr, config).await?;
    println!("Connected to {server_addr}");

    println!("\n--- Unary ---");
    let response = client
        .greet(
            Greeting::new("Muhammad").with_last_name("Ilham"),
            CallOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await?;
    println!("{}", response.result);

    println!("\n--- Server streaming ---");
    let mut stream = client
        .greet_many_times(Greeting::new("Muhammad"), CallOptions::new())
        .await?;
    while let Some(response) = stream.message().await? {
        println!("{}", response.result);
    }

    let names = ["Ilham", "Nando", "Faway", "Ester C", "Hanafi"];
    let greetings = || names.iter().map(|name| Greeting::new(*name)).collect::<Vec<_>>();

    println!("\n--- Client streaming ---");
    let response = client
        .long_greet(
            greetings(),
            Some(Duration::from_millis(200)),
            CallOptions::new(),
        )
        .await?;
    println!("{}", response.result);

    println!("\n--- Bidirectional streaming ---");
    let coordinator = StreamCoordinator::new().with_pacing(Duration::from_millis(200));
    let summary = client
        .greet_everyone(greetings(), &coordinator, CallOptions::new(), |response| {
            println!("Receiving: {}", response.result);
        })
        .await?;
    println!("sent {} received {}", summary.sent, summary.received);

    println!("\n--- Square root ---");
    for number in [16, -4] {
        match client.square_root(number, CallOptions::new()).await {
            Ok(response) => println!("sqrt({number}) = {}", response.root),
            Err(err) => println!("sqrt({number}) failed with {}: {err}", err.code()),
        }
    }

    Ok(())
}
