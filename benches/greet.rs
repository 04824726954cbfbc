use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use greetnet::greet::{GreetClient, GreetServer, GreetService, Greeting};
use greetnet::transport::memory;
use greetnet::{CallOptions, RpcClient, RpcConfig, StreamCoordinator};

// ==========================
//   Benchmark Setup
// ==========================
fn start(rt: &Runtime) -> GreetClient {
    rt.block_on(async {
        let (connector, mut listener) = memory::listener(64);
        let server = GreetServer::new(GreetService::new(), RpcConfig::in_memory());
        tokio::spawn(async move {
            let _ = server.serve_with_adapter(&mut listener).await;
        });
        let connection = connector.connect().expect("memory listener");
        GreetClient::new(RpcClient::with_connection(connection, RpcConfig::in_memory()))
    })
}

fn bench_unary_greet(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = start(&rt);

    c.bench_function("unary greet", |b| {
        b.iter_custom(|iterations| {
            let start = std::time::Instant::now();
            rt.block_on(async {
                for _ in 0..iterations {
                    client
                        .greet(Greeting::new("bench"), CallOptions::new())
                        .await
                        .unwrap();
                }
            });
            start.elapsed()
        });
    });
}

fn bench_greet_everyone(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = start(&rt);
    let coordinator = StreamCoordinator::new();

    c.bench_function("bidi greet everyone x32", |b| {
        b.iter_custom(|iterations| {
            let start = std::time::Instant::now();
            rt.block_on(async {
                for _ in 0..iterations {
                    let greetings = (0..32).map(|i| Greeting::new(format!("n{i}"))).collect();
                    let summary = client
                        .greet_everyone(greetings, &coordinator, CallOptions::new(), |_| {})
                        .await
                        .unwrap();
                    assert_eq!(summary.received, 32);
                }
            });
            start.elapsed()
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_unary_greet, bench_greet_everyone
}

criterion_main!(benches);
