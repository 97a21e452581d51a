//! Echo client.
//!
//! Sends one message to a running `echo_server` and prints the reply.
//!
//! ```text
//! cargo run --example echo_client -- "hello there" 127.0.0.1 8080
//! ```

use std::time::Duration;

use packrpc::{Client, RpcError, DEFAULT_PORT};
use tracing_subscriber::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let message = args.next().unwrap_or_else(|| "hello".to_string());
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(arg) => arg.parse()?,
        None => DEFAULT_PORT,
    };

    let client = Client::builder()
        .timeout(Duration::from_millis(50))
        .connect(&host, port)?;

    match client.call::<String, _>("echo", (message.as_str(),)) {
        Ok(reply) => println!("{reply}"),
        Err(RpcError::Timeout { after, .. }) => {
            eprintln!("echo did not answer within {after:?}");
        }
        Err(e) => return Err(e.into()),
    }

    let sum: i64 = client.call("add", (2, 3))?;
    println!("2 + 3 = {sum}");

    if !client.is_connected() {
        eprintln!("connection lost");
    }
    Ok(())
}
