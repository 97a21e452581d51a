//! TCP listener and stream helpers.
//!
//! # Example
//!
//! ```
//! use packrpc::transport::bind_listener;
//!
//! let listener = bind_listener("127.0.0.1", 0).unwrap();
//! assert_ne!(listener.local_addr().unwrap().port(), 0);
//! ```

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Result, RpcError};

/// Render `host:port` for error messages and logs.
pub fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Open, bind and listen on `host:port`, ready to hand to tokio.
///
/// Port 0 picks a free port; read it back with `local_addr()`.
///
/// # Errors
///
/// [`RpcError::Bind`] if the address cannot be resolved or bound.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let bind_error = |source| RpcError::Bind {
        addr: endpoint(host, port),
        source,
    };

    let listener = TcpListener::bind((host, port)).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

/// Connect to `host:port`, trying every resolved address in turn.
///
/// With a `timeout`, each address gets at most that long to accept.
///
/// # Errors
///
/// [`RpcError::Connect`] with the last failure if no address accepts.
pub fn connect_stream(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let connect_error = |source| RpcError::Connect {
        addr: endpoint(host, port),
        source,
    };

    let stream = match timeout.filter(|t| !t.is_zero()) {
        None => TcpStream::connect((host, port)).map_err(connect_error)?,
        Some(timeout) => connect_within(host, port, timeout).map_err(connect_error)?,
    };
    stream.set_nonblocking(true).map_err(connect_error)?;
    Ok(stream)
}

fn connect_within(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "host resolved to no addresses")))
}

/// Apply per-connection socket options.
pub fn configure_stream(stream: &tokio::net::TcpStream, nodelay: bool) -> Result<()> {
    stream.set_nodelay(nodelay)?;
    Ok(())
}
