//! Ping RPC example using the in-memory broker.
//!
//! Runs a server and a client in one process over a pooled `MemoryBroker`,
//! then fires a burst of concurrent requests through the same client.
//!
//! Run with: RUST_LOG=info cargo run --example ping_memory

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

use amqp_rpc::{
    // ---
    handler_fn,
    json_handler,
    ConnectionPool,
    MemoryBroker,
    PoolConfig,
    Request,
    Result,
    RpcClient,
    RpcConfig,
    RpcServer,
};

#[derive(Debug, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sum {
    sum: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker = MemoryBroker::new();
    let pool = ConnectionPool::open(
        PoolConfig::new("memory://")
            .with_connections(1, 2)
            .with_channels(2, 8),
        broker.connector(),
    )
    .await?;

    // --- plain text ping
    let ping_config = RpcConfig::new("ping")
        .with_content_type("text/plain")
        .with_consumers(2);

    let ping_server = RpcServer::new(
        pool.clone(),
        ping_config.clone(),
        handler_fn(|req: Request| async move {
            let text = String::from_utf8_lossy(&req.payload).into_owned();
            Ok(Bytes::from(format!("{text} processed")))
        }),
    );
    ping_server.start().await?;

    let ping_client = RpcClient::start(pool.clone(), ping_config).await?;
    let reply = ping_client.send("ping").await?;
    println!("ping -> {}", String::from_utf8_lossy(&reply));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = ping_client.clone();
        tasks.push(tokio::spawn(async move { client.send(format!("ping-{i}")).await }));
    }
    for task in tasks {
        let reply = task.await.expect("task panicked")?;
        println!("  {}", String::from_utf8_lossy(&reply));
    }

    // --- typed JSON call
    let math_config = RpcConfig::new("math.add");
    let math_server = RpcServer::new(
        pool.clone(),
        math_config.clone(),
        json_handler(|req: Add| async move { Ok(Sum { sum: req.a + req.b }) }),
    );
    math_server.start().await?;

    let math_client = RpcClient::start(pool.clone(), math_config).await?;
    let sum: Sum = math_client.call(&Add { a: 40, b: 2 }).await?;
    println!("40 + 2 = {}", sum.sum);

    println!("pool: {:?}", pool.stats());

    ping_client.shutdown().await;
    math_client.shutdown().await;
    ping_server.shutdown().await;
    math_server.shutdown().await;
    pool.close().await;

    Ok(())
}
