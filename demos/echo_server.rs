//! Echo server.
//!
//! Binds `echo` and `add` and serves them on one dispatch thread per core.
//!
//! ```text
//! cargo run --example echo_server -- 8080
//! RUST_LOG=packrpc=debug cargo run --example echo_server
//! ```

use packrpc::{Server, DEFAULT_PORT};
use tracing_subscriber::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,packrpc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => DEFAULT_PORT,
    };

    let server = Server::with_port(port)?;
    server.bind("echo", |message: String| message)?;
    server.bind("add", |a: i64, b: i64| a + b)?;
    server.suppress_exceptions(true);

    let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
    tracing::info!(port, workers, "Echo server ready");

    // The main thread becomes one more dispatch worker.
    server.async_run(workers.saturating_sub(1))?;
    server.run();
    Ok(())
}
