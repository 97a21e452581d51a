//! Server: listening socket, live sessions and the reactor that runs
//! bound functions.
//!
//! Socket I/O happens on a small tokio runtime owned by the server. Every
//! decoded Call or Notification is posted to the [`Reactor`] and nothing is
//! dispatched until some thread drives it with [`Server::run`] (or
//! `run_one`, `poll`, `poll_one`) or [`Server::async_run`].
//!
//! [`Server::stop`] shuts all of it down: dispatch, listeners and
//! connections.
//!
//! # Example
//!
//! ```no_run
//! use packrpc::Server;
//!
//! fn main() -> packrpc::Result<()> {
//!     let server = Server::with_port(8080)?;
//!     server.bind("echo", |s: String| s)?;
//!     server.bind("add", |a: i64, b: i64| a + b)?;
//!
//!     server.run();
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::handler::{Dispatcher, IntoHandler};
use crate::protocol::{Envelope, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE};
use crate::reactor::{Reactor, DEFAULT_QUEUE_CAPACITY};
use crate::session::{CloseReason, Session, SessionConfig, SessionId, SessionRole};
use crate::transport::{bind_listener, configure_stream};
use crate::writer::{WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY};

/// Port used by the demos and by [`Server::with_port`] callers that have no
/// preference.
pub const DEFAULT_PORT: u16 = 8080;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long `stop` waits for each accept loop to release its listener.
const ACCEPT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Threads in the I/O runtime. Default: 1
    pub io_threads: usize,
    /// Largest envelope accepted from a peer. Default: 64 MiB
    pub max_message_size: usize,
    /// Read buffer reservation per read. Default: 64 KiB
    pub read_buffer_size: usize,
    /// Set `TCP_NODELAY` on accepted connections. Default: true
    pub nodelay: bool,
    /// Turn panics in bound functions into error responses. Default: false
    pub suppress_exceptions: bool,
    /// Dispatch jobs waiting for a driver before sessions stop reading.
    /// Default: 1024
    pub queue_capacity: usize,
    /// Responses queued per session before dispatch waits. Default: 1024
    pub channel_capacity: usize,
    /// How long a response waits for room in a full session queue.
    /// Default: 5s
    pub backpressure_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            io_threads: 1,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
            nodelay: true,
            suppress_exceptions: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    endpoint: Option<(String, u16)>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            endpoint: None,
        }
    }

    /// Listen on `host:port` as soon as the server is built.
    pub fn address(mut self, host: &str, port: u16) -> Self {
        self.endpoint = Some((host.to_string(), port));
        self
    }

    /// Listen on `0.0.0.0:port` as soon as the server is built.
    pub fn port(self, port: u16) -> Self {
        self.address("0.0.0.0", port)
    }

    /// Set the number of I/O threads.
    ///
    /// Default: 1
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    /// Set the largest envelope accepted from a peer.
    ///
    /// Default: 64 MiB
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Set the read buffer reservation.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.config.read_buffer_size = bytes;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    ///
    /// Default: true
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Set the initial exception suppression mode.
    ///
    /// Default: false
    pub fn suppress_exceptions(mut self, suppress: bool) -> Self {
        self.config.suppress_exceptions = suppress;
        self
    }

    /// Set the dispatch queue capacity.
    ///
    /// Default: 1024
    pub fn queue_capacity(mut self, jobs: usize) -> Self {
        self.config.queue_capacity = jobs;
        self
    }

    /// Set the per-session response queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, messages: usize) -> Self {
        self.config.channel_capacity = messages;
        self
    }

    /// Set how long a response waits for a full session queue.
    ///
    /// Default: 5s
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout = timeout;
        self
    }

    /// Build the server, binding the listener if an endpoint was given.
    ///
    /// # Errors
    ///
    /// [`RpcError::Bind`](crate::RpcError::Bind) if the endpoint cannot be
    /// bound, or an I/O error if the runtime cannot start.
    pub fn build(self) -> Result<Server> {
        let server = Server::from_config(self.config)?;
        if let Some((host, port)) = self.endpoint {
            server.accept(&host, port)?;
        }
        Ok(server)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared with sessions through a non-owning reference.
struct Shared {
    /// Replaced wholesale on bind so dispatch never holds the lock while a
    /// function runs.
    dispatcher: RwLock<Arc<Dispatcher>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_session: AtomicU64,
    suppress_exceptions: AtomicBool,
    session_config: SessionConfig,
    nodelay: bool,
}

impl Shared {
    /// Run one envelope through the dispatcher and queue the reply.
    fn dispatch(&self, session: &Session, envelope: Envelope) {
        let suppress = self.suppress_exceptions.load(Ordering::Relaxed);
        let dispatcher = Arc::clone(&self.dispatcher.read());
        let outcome = dispatcher.dispatch(envelope, suppress);

        match outcome {
            Ok(Some(response)) => {
                let id = response.id;
                match session.send(response.into()) {
                    Ok(()) => {}
                    Err(RpcError::BackpressureTimeout) => {
                        tracing::warn!(session = session.id(), id, "Peer is not reading responses, closing session");
                        session.abort(CloseReason::Backpressure);
                    }
                    Err(e) => {
                        tracing::debug!(session = session.id(), id, error = %e, "Dropping response");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session = session.id(), error = %e, "Closing session after failed dispatch");
                session.abort(CloseReason::HandlerPanicked);
            }
        }
    }

    fn close_all(&self, reason: CloseReason) {
        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close_because(reason);
        }
    }
}

/// Server side of a session: hands envelopes to the reactor.
struct ServerRole {
    server: Weak<Shared>,
    reactor: Arc<Reactor>,
}

impl SessionRole for ServerRole {
    fn name(&self) -> &'static str {
        "server"
    }

    fn on_envelope(&self, session: &Session, envelope: Envelope) -> impl Future<Output = ()> + Send {
        let shared = self.server.upgrade();
        let reactor = self.reactor.clone();
        let session = session.clone();

        async move {
            if let Envelope::Response(response) = &envelope {
                tracing::warn!(id = response.id, "Server received a response, dropping");
                return;
            }
            let Some(shared) = shared else {
                return;
            };

            let id = session.id();
            let posted = reactor
                .post_async(move || shared.dispatch(&session, envelope))
                .await;
            if posted.is_err() {
                tracing::debug!(session = id, "Server stopped, dropping request");
            }
        }
    }

    fn on_closed(&self, session: &Session, reason: CloseReason) {
        if let Some(shared) = self.server.upgrade() {
            shared.sessions.lock().remove(&session.id());
        }
        tracing::info!(session = session.id(), peer = %session.peer(), ?reason, "Connection closed");
    }
}

/// A msgpack-RPC server.
pub struct Server {
    shared: Arc<Shared>,
    reactor: Arc<Reactor>,
    runtime: Option<Runtime>,
    handle: Handle,
    acceptors: CancellationToken,
    /// One receiver per accept loop; disconnects once the loop has dropped
    /// its listener.
    accept_loops: Mutex<Vec<flume::Receiver<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Create a server that is not listening yet. Call [`Server::accept`].
    pub fn new() -> Result<Self> {
        Self::from_config(ServerConfig::default())
    }

    /// Create a server listening on `host:port`.
    pub fn with_address(host: &str, port: u16) -> Result<Self> {
        ServerBuilder::new().address(host, port).build()
    }

    /// Create a server listening on `0.0.0.0:port`.
    pub fn with_port(port: u16) -> Result<Self> {
        ServerBuilder::new().port(port).build()
    }

    fn from_config(config: ServerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("packrpc-server-io")
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared {
            dispatcher: RwLock::new(Arc::new(Dispatcher::new())),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            suppress_exceptions: AtomicBool::new(config.suppress_exceptions),
            session_config: SessionConfig {
                max_message_size: config.max_message_size,
                read_buffer_size: config.read_buffer_size,
                writer: WriterConfig {
                    channel_capacity: config.channel_capacity,
                    backpressure_timeout: config.backpressure_timeout,
                },
            },
            nodelay: config.nodelay,
        });

        Ok(Self {
            shared,
            reactor: Arc::new(Reactor::with_capacity(config.queue_capacity)),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            acceptors: CancellationToken::new(),
            accept_loops: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind and listen on `host:port`, then accept connections in the
    /// background for the lifetime of the server.
    ///
    /// Returns the bound address, which is useful with port 0.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Bind`], reported here rather than from the accept loop
    /// - [`RpcError::Stopped`] after [`Server::stop`]
    pub fn accept(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.reactor.is_stopped() {
            return Err(RpcError::Stopped);
        }
        let listener = bind_listener(host, port)?;
        let addr = listener.local_addr()?;

        let listener = {
            let _guard = self.handle.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        tracing::info!(%addr, "Listening");
        *self.local_addr.lock() = Some(addr);

        let (done, finished) = flume::bounded(0);
        self.accept_loops.lock().push(finished);
        self.handle.spawn(accept_loop(
            listener,
            Arc::downgrade(&self.shared),
            self.reactor.clone(),
            self.handle.clone(),
            self.acceptors.child_token(),
            done,
        ));

        Ok(addr)
    }

    /// Bind and listen on `0.0.0.0:port`.
    pub fn accept_port(&self, port: u16) -> Result<SocketAddr> {
        self.accept("0.0.0.0", port)
    }

    /// Address of the most recent successful [`Server::accept`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind `function` under `name`.
    ///
    /// May be called at any time, including from inside a bound function.
    /// Calls already being dispatched keep the registry they started with.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateName`] if the name is taken.
    pub fn bind<F, Args>(&self, name: &str, function: F) -> Result<()>
    where
        F: IntoHandler<Args>,
        Args: 'static,
    {
        let mut dispatcher = self.shared.dispatcher.write();
        Arc::make_mut(&mut dispatcher).bind(name, function)
    }

    /// Toggle exception suppression for all sessions.
    pub fn suppress_exceptions(&self, suppress: bool) {
        self.shared
            .suppress_exceptions
            .store(suppress, Ordering::Relaxed);
    }

    /// Run dispatch jobs on the calling thread until [`Server::stop`].
    ///
    /// Returns the number of jobs executed.
    pub fn run(&self) -> usize {
        self.reactor.run()
    }

    /// Block until one dispatch job has run or the server is stopped.
    pub fn run_one(&self) -> usize {
        self.reactor.run_one()
    }

    /// Run all ready dispatch jobs without blocking.
    pub fn poll(&self) -> usize {
        self.reactor.poll()
    }

    /// Run at most one ready dispatch job without blocking.
    pub fn poll_one(&self) -> usize {
        self.reactor.poll_one()
    }

    /// Spawn `threads` workers that drive the reactor.
    ///
    /// # Errors
    ///
    /// Returns error if a worker thread cannot be spawned.
    pub fn async_run(&self, threads: usize) -> Result<()> {
        self.reactor.async_run(threads)
    }

    /// Stop the server. Idempotent.
    ///
    /// Dispatch stops and workers are joined, queued jobs are discarded,
    /// every listener is closed and every session is closed after flushing
    /// what it already queued. Afterwards new connections are refused and
    /// [`Server::accept`] fails with [`RpcError::Stopped`].
    pub fn stop(&self) {
        self.reactor.stop();
        self.acceptors.cancel();

        let loops = std::mem::take(&mut *self.accept_loops.lock());
        for finished in loops {
            // Disconnects once the loop has dropped its listener.
            if let Err(flume::RecvTimeoutError::Timeout) = finished.recv_timeout(ACCEPT_STOP_TIMEOUT) {
                tracing::warn!("Accept loop did not exit in time");
            }
        }

        if self.session_count() > 0 {
            tracing::debug!(count = self.session_count(), "Closing sessions on stop");
        }
        self.shared.close_all(CloseReason::Stopped);
    }

    /// Close every live session and clear the registry.
    pub fn close_sessions(&self) {
        tracing::debug!(count = self.session_count(), "Closing all sessions");
        self.shared.close_all(CloseReason::Local);
    }

    /// Close one session. Returns false if it is no longer registered.
    pub fn close_session(&self, id: SessionId) -> bool {
        let session = self.shared.sessions.lock().remove(&id);
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Handles to every live session.
    pub fn sessions(&self) -> Vec<Session> {
        self.shared.sessions.lock().values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    server: Weak<Shared>,
    reactor: Arc<Reactor>,
    handle: Handle,
    cancel: CancellationToken,
    done: flume::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let Some(shared) = server.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = configure_stream(&stream, shared.nodelay) {
                    tracing::warn!(%peer, error = %e, "Failed to configure connection");
                }

                let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
                let role = Arc::new(ServerRole {
                    server: server.clone(),
                    reactor: reactor.clone(),
                });

                // Held across spawn so a session that dies at once cannot
                // deregister before it is registered.
                {
                    let mut sessions = shared.sessions.lock();
                    let session = Session::spawn(
                        &handle,
                        stream,
                        id,
                        peer,
                        role,
                        shared.session_config.clone(),
                    );
                    sessions.insert(id, session);
                }

                tracing::info!(session = id, %peer, "Accepted connection");
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::debug!("Accept loop exiting");
    drop(listener);
    drop(done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Call, EnvelopeBuffer, Notification};
    use rmpv::Value;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn read_envelope(stream: &mut TcpStream) -> Envelope {
        let mut buffer = EnvelopeBuffer::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed");
            if let Some(envelope) = buffer.push(&chunk[..n]).unwrap().into_iter().next() {
                return envelope;
            }
        }
    }

    fn local_server() -> (Server, SocketAddr) {
        let server = Server::new().unwrap();
        let addr = server.accept("127.0.0.1", 0).unwrap();
        (server, addr)
    }

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.nodelay);
        assert!(!config.suppress_exceptions);
    }

    #[test]
    fn test_bind_error_is_synchronous() {
        let (server, addr) = local_server();
        let err = server.accept("127.0.0.1", addr.port()).unwrap_err();
        assert!(matches!(err, crate::RpcError::Bind { .. }));
    }

    #[test]
    fn test_dispatch_only_when_driven() {
        let (server, addr) = local_server();
        server.bind("echo", |s: String| s).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let call = Envelope::Call(Call::new(9, "echo", vec![Value::from("hi")]));
        stream.write_all(&call.encode().unwrap()).unwrap();

        assert!(wait_for(|| server.reactor.pending() == 1));
        assert_eq!(server.poll(), 1);

        let Envelope::Response(response) = read_envelope(&mut stream) else {
            panic!("expected response");
        };
        assert_eq!(response.id, 9);
        assert_eq!(response.result(), Some(&Value::from("hi")));
    }

    #[test]
    fn test_sessions_tracked_and_closed() {
        let (server, addr) = local_server();

        let mut first = TcpStream::connect(addr).unwrap();
        let _second = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| server.session_count() == 2));

        let id = server.sessions()[0].id();
        assert!(server.close_session(id));
        assert!(!server.close_session(id));
        assert_eq!(server.session_count(), 1);

        server.close_sessions();
        assert_eq!(server.session_count(), 0);

        let mut buf = [0u8; 8];
        first
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(first.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_peer_disconnect_deregisters() {
        let (server, addr) = local_server();

        let stream = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| server.session_count() == 1));

        drop(stream);
        assert!(wait_for(|| server.session_count() == 0));
    }

    #[test]
    fn test_panic_without_suppression_closes_session() {
        let (server, addr) = local_server();
        server.bind("boom", || -> i32 { panic!("kaboom") }).unwrap();
        server.async_run(1).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let call = Envelope::Call(Call::new(1, "boom", vec![]));
        stream.write_all(&call.encode().unwrap()).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
        assert!(wait_for(|| server.session_count() == 0));
    }

    #[test]
    fn test_notification_writes_nothing() {
        let (server, addr) = local_server();
        let (tx, rx) = flume::unbounded();
        server
            .bind("fail", move || -> std::result::Result<(), String> {
                let _ = tx.send(());
                Err("always".to_string())
            })
            .unwrap();
        server.async_run(1).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let note = Envelope::Notification(Notification::new("fail", vec![]));
        stream.write_all(&note.encode().unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 64];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let server = Server::new().unwrap();
        server.async_run(2).unwrap();
        server.stop();
        server.stop();
        assert_eq!(server.poll(), 0);
    }

    #[test]
    fn test_stop_closes_listener_and_sessions() {
        let (server, addr) = local_server();
        server.async_run(1).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| server.session_count() == 1));

        server.stop();
        assert_eq!(server.session_count(), 0);

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));

        assert!(TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_err());
        assert!(matches!(
            server.accept("127.0.0.1", 0),
            Err(RpcError::Stopped)
        ));
    }

    #[test]
    fn test_stop_drops_requests_instead_of_queueing() {
        let (server, addr) = local_server();
        server.bind("echo", |s: String| s).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let call = Envelope::Call(Call::new(1, "echo", vec![Value::from("a")]));
        stream.write_all(&call.encode().unwrap()).unwrap();
        assert!(wait_for(|| server.reactor.pending() == 1));

        server.stop();
        assert_eq!(server.reactor.pending(), 0);
        assert_eq!(server.run(), 0);
    }

    #[test]
    fn test_bind_inside_bound_function() {
        let server = Arc::new(Server::new().unwrap());
        let addr = server.accept("127.0.0.1", 0).unwrap();
        let weak = Arc::downgrade(&server);
        server
            .bind("install", move || -> std::result::Result<bool, String> {
                let server = weak.upgrade().ok_or("server gone")?;
                server.bind("late", || 7).map_err(|e| e.to_string())?;
                Ok(true)
            })
            .unwrap();
        server.async_run(1).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let install = Envelope::Call(Call::new(1, "install", vec![]));
        stream.write_all(&install.encode().unwrap()).unwrap();
        let Envelope::Response(first) = read_envelope(&mut stream) else {
            panic!("expected response");
        };
        assert_eq!(first.result(), Some(&Value::from(true)));

        let late = Envelope::Call(Call::new(2, "late", vec![]));
        stream.write_all(&late.encode().unwrap()).unwrap();
        let Envelope::Response(second) = read_envelope(&mut stream) else {
            panic!("expected response");
        };
        assert_eq!(second.result(), Some(&Value::from(7)));

        server.stop();
    }

    #[test]
    fn test_unread_responses_close_session() {
        let server = Server::builder()
            .channel_capacity(1)
            .backpressure_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let addr = server.accept("127.0.0.1", 0).unwrap();
        let payload = "x".repeat(1024 * 1024);
        server.bind("big", move || payload.clone()).unwrap();
        server.async_run(1).unwrap();

        // Never read, so the socket buffers fill and the queue backs up.
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut id = 0;
        let closed = wait_for(|| {
            id += 1;
            let call = Envelope::Call(Call::new(id, "big", vec![]));
            stream.write_all(&call.encode().unwrap()).is_err() || server.session_count() == 0
        });
        assert!(closed);
    }
}
