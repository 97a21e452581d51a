//! Calculator: server and client in one process.
//!
//! Shows blocking calls, pipelined non-blocking calls, application errors,
//! dispatch errors and notifications.
//!
//! ```text
//! cargo run --example calculator
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use packrpc::{Client, Msgpack, RemoteErrorKind, RpcError, Server};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;

#[derive(Serialize, Deserialize, Debug)]
struct Stats {
    count: usize,
    mean: f64,
    min: f64,
    max: f64,
}

fn stats(values: Vec<f64>) -> Result<Msgpack<Stats>, String> {
    if values.is_empty() {
        return Err("stats of an empty list".to_string());
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok(Msgpack(Stats {
        count,
        mean,
        min,
        max,
    }))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,calculator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let memory: Arc<Mutex<HashMap<String, f64>>> = Arc::default();

    let server = Server::new()?;
    server.bind("add", |a: f64, b: f64| a + b)?;
    server.bind("sub", |a: f64, b: f64| a - b)?;
    server.bind("mul", |a: f64, b: f64| a * b)?;
    server.bind("div", |a: f64, b: f64| {
        if b == 0.0 {
            Err("division by zero")
        } else {
            Ok(a / b)
        }
    })?;
    server.bind("stats", stats)?;
    {
        let memory = memory.clone();
        server.bind("store", move |name: String, value: f64| {
            memory.lock().insert(name, value);
        })?;
    }
    {
        let memory = memory.clone();
        server.bind("recall", move |name: String| memory.lock().get(&name).copied())?;
    }

    let addr = server.accept("127.0.0.1", 0)?;
    // One worker keeps dispatch in arrival order, so `store` lands before `recall`.
    server.async_run(1)?;
    tracing::info!(%addr, "Calculator listening");

    let client = Client::connect("127.0.0.1", addr.port())?;

    let sum: f64 = client.call("add", (1.5, 2.25))?;
    println!("1.5 + 2.25 = {sum}");

    let pending: Vec<_> = (1..=5)
        .map(|n| client.async_call::<f64, _>("mul", (n as f64, n as f64)))
        .collect::<Result<_, _>>()?;
    let squares = pending
        .into_iter()
        .map(|handle| handle.wait())
        .collect::<Result<Vec<_>, _>>()?;
    println!("squares: {squares:?}");

    match client.call::<f64, _>("div", (1.0, 0.0)) {
        Err(RpcError::Remote(e)) => println!("div failed remotely: {}", e.message),
        other => println!("unexpected: {other:?}"),
    }

    match client.call::<f64, _>("pow", (2.0, 8.0)) {
        Err(e) if e.remote_kind() == Some(RemoteErrorKind::MethodNotFound) => {
            println!("pow is not bound");
        }
        other => println!("unexpected: {other:?}"),
    }

    let summary: Stats = client.call("stats", (vec![3.0, 1.0, 4.0, 1.0, 5.0],))?;
    println!("stats: {summary:?}");

    client.notify("store", ("x", 42.0))?;
    let recalled: Option<f64> = client.call("recall", ("x",))?;
    println!("recalled x = {recalled:?}");

    client.close();
    server.stop();
    Ok(())
}
