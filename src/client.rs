//! Client: one connection, blocking and non-blocking calls.
//!
//! The [`Client`] owns its [`Session`] and a [`Correlator`] of outstanding
//! calls. Socket I/O runs on a private tokio runtime, so blocking calls work
//! from plain threads; the I/O thread wakes the caller when the matching
//! Response is decoded.
//!
//! A lost connection can be replaced with [`Client::reconnect`], or
//! automatically on the next call when auto-reconnect is on. Calls that were
//! outstanding on the old connection fail; they are never resent.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use packrpc::Client;
//!
//! fn main() -> packrpc::Result<()> {
//!     let client = Client::builder()
//!         .timeout(Duration::from_secs(1))
//!         .connect_timeout(Duration::from_secs(3))
//!         .connect("127.0.0.1", 8080)?;
//!
//!     let greeting: String = client.call("echo", ("hi",))?;
//!     let sum: i64 = client.call("add", (2, 3))?;
//!     println!("{greeting} {sum}");
//!
//!     let pending = client.async_call::<i64, _>("add", (40, 2))?;
//!     assert_eq!(pending.wait()?, 42);
//!
//!     client.notify("log", ("fire and forget",))?;
//!     Ok(())
//! }
//! ```

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::runtime::{Handle, Runtime};

use crate::codec::{IntoParams, MsgPackCodec};
use crate::correlator::{Correlator, Resolution, Ticket};
use crate::error::{Result, RpcError};
use crate::protocol::{Call, Envelope, Notification, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE};
use crate::session::{CloseReason, Session, SessionConfig, SessionId, SessionRole, SessionState};
use crate::transport::{configure_stream, connect_stream, endpoint};
use crate::writer::{WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY};

/// Default pause between automatic reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait bound for each call. `None` waits indefinitely. Default: None
    pub timeout: Option<Duration>,
    /// Bound on establishing the connection. Default: None (OS default)
    pub connect_timeout: Option<Duration>,
    /// Reconnect on the next call after the connection is lost.
    /// Default: false
    pub auto_reconnect: bool,
    /// Minimum pause between automatic reconnect attempts. Default: 1s
    pub reconnect_interval: Duration,
    /// Largest envelope accepted from the server. Default: 64 MiB
    pub max_message_size: usize,
    /// Read buffer reservation per read. Default: 64 KiB
    pub read_buffer_size: usize,
    /// Outgoing envelopes queued before senders wait. Default: 1024
    pub channel_capacity: usize,
    /// How long a call waits for room in a full queue. Default: 5s
    pub backpressure_timeout: Duration,
    /// Set `TCP_NODELAY`. Default: true
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: None,
            auto_reconnect: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.max_message_size,
            read_buffer_size: self.read_buffer_size,
            writer: WriterConfig {
                channel_capacity: self.channel_capacity,
                backpressure_timeout: self.backpressure_timeout,
            },
        }
    }
}

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the per-call wait bound.
    ///
    /// Default: wait indefinitely
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Bound how long connecting (and reconnecting) may take.
    ///
    /// Default: the OS connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Reconnect on the next call after the connection is lost.
    ///
    /// Default: false
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Set the minimum pause between automatic reconnect attempts.
    ///
    /// Default: 1s
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Set the largest envelope accepted from the server.
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

    /// Set the outgoing queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, messages: usize) -> Self {
        self.config.channel_capacity = messages;
        self
    }

    /// Set how long a call waits for room in a full queue.
    ///
    /// Default: 5s
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    ///
    /// Default: true
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Connect to `host:port`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Connect`] if the connection cannot be established.
    pub fn connect(self, host: &str, port: u16) -> Result<Client> {
        Client::connect_with(host, port, self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side of a session: resolves responses.
struct ClientRole {
    correlator: Arc<Correlator>,
}

impl SessionRole for ClientRole {
    fn name(&self) -> &'static str {
        "client"
    }

    fn on_envelope(&self, _session: &Session, envelope: Envelope) -> impl std::future::Future<Output = ()> + Send {
        match envelope {
            Envelope::Response(response) => {
                self.correlator.resolve(response);
            }
            Envelope::Call(call) => {
                tracing::warn!(id = call.id, method = %call.method, "Client received a call, dropping");
            }
            Envelope::Notification(note) => {
                tracing::warn!(method = %note.method, "Client received a notification, dropping");
            }
        }
        std::future::ready(())
    }

    fn on_closed(&self, session: &Session, reason: CloseReason) {
        tracing::info!(peer = %session.peer(), ?reason, "Disconnected");
        self.correlator.fail_all(reason);
    }
}

/// One connection and the calls waiting on it.
#[derive(Clone)]
struct Link {
    session: Session,
    correlator: Arc<Correlator>,
    /// Start of the attempt that produced (or failed to replace) this link.
    attempted_at: Instant,
}

impl Link {
    fn retire(&self) {
        self.session.close();
        self.correlator.fail_all(CloseReason::Local);
    }
}

/// A connected msgpack-RPC client.
pub struct Client {
    host: String,
    port: u16,
    config: ClientConfig,
    link: Mutex<Link>,
    next_session: AtomicU64,
    auto_reconnect: AtomicBool,
    /// Set by [`Client::close`]; a closed client is only revived by an
    /// explicit [`Client::reconnect`].
    closed_locally: AtomicBool,
    timeout: Mutex<Option<Duration>>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to `host:port` with default settings.
    ///
    /// # Errors
    ///
    /// [`RpcError::Connect`] if the connection cannot be established.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(host, port, ClientConfig::default())
    }

    fn connect_with(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("packrpc-client-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let link = open_link(&handle, host, port, &config, 0)?;

        Ok(Self {
            host: host.to_string(),
            port,
            link: Mutex::new(link),
            next_session: AtomicU64::new(1),
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            closed_locally: AtomicBool::new(false),
            timeout: Mutex::new(config.timeout),
            config,
            handle,
            runtime: Some(runtime),
        })
    }

    fn dial(&self) -> Result<Link> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        open_link(&self.handle, &self.host, self.port, &self.config, id)
    }

    /// The open link, reconnecting first when auto-reconnect allows it.
    fn current(&self) -> Result<Link> {
        let mut link = self.link.lock();
        if link.session.is_open() {
            return Ok(link.clone());
        }

        let allowed = self.auto_reconnect() && !self.closed_locally.load(Ordering::SeqCst);
        if !allowed || link.attempted_at.elapsed() < self.config.reconnect_interval {
            return Err(RpcError::NotConnected);
        }

        tracing::info!(addr = %endpoint(&self.host, self.port), "Reconnecting");
        link.attempted_at = Instant::now();
        let fresh = self.dial()?;
        let stale = std::mem::replace(&mut *link, fresh);
        stale.retire();
        Ok(link.clone())
    }

    /// Drop the current connection and dial the server again.
    ///
    /// Calls outstanding on the old connection fail with
    /// [`RpcError::NotConnected`]. Also revives a client that was closed
    /// with [`Client::close`].
    ///
    /// # Errors
    ///
    /// [`RpcError::Connect`] if the new connection cannot be established.
    /// The client is then disconnected.
    pub fn reconnect(&self) -> Result<()> {
        let mut link = self.link.lock();
        link.attempted_at = Instant::now();
        link.retire();
        self.closed_locally.store(false, Ordering::SeqCst);

        *link = self.dial()?;
        Ok(())
    }

    /// Enable or disable reconnecting on the next call after the
    /// connection is lost.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Whether auto-reconnect is on.
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Call `method` and block until it resolves.
    ///
    /// `args` is a tuple of arguments (`()` for none, `(x,)` for one).
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] if the server answered with an error
    /// - [`RpcError::NotConnected`] if the session is not open
    /// - [`RpcError::Timeout`] if the configured wait bound elapsed
    /// - [`RpcError::TypeMismatch`] if the result does not decode into `R`
    /// - [`RpcError::BackpressureTimeout`] if the outgoing queue stayed full
    pub fn call<R, A>(&self, method: &str, args: A) -> Result<R>
    where
        R: DeserializeOwned,
        A: IntoParams,
    {
        self.async_call(method, args)?.wait()
    }

    /// Send a call and return a handle to its pending result.
    ///
    /// The wait bound in force now applies to the returned handle.
    pub fn async_call<R, A>(&self, method: &str, args: A) -> Result<CallHandle<R>>
    where
        R: DeserializeOwned,
        A: IntoParams,
    {
        let params = args.into_params()?;
        let link = self.current()?;

        let Ticket { id, token, rx } = link.correlator.register()?;
        let handle = CallHandle {
            id,
            token,
            rx,
            timeout: self.timeout().map(|after| (Instant::now() + after, after)),
            correlator: link.correlator.clone(),
            runtime: self.handle.clone(),
            _marker: PhantomData,
        };

        tracing::trace!(id, method, "Sending call");
        let bytes = Envelope::Call(Call::new(id, method, params)).into_bytes()?;
        link.session.enqueue(Bytes::from(bytes))?;

        Ok(handle)
    }

    /// Send a notification. No response is ever produced.
    pub fn notify<A: IntoParams>(&self, method: &str, args: A) -> Result<()> {
        let params = args.into_params()?;
        let link = self.current()?;
        link.session
            .send(Envelope::Notification(Notification::new(method, params)))
    }

    /// Set the wait bound for subsequent calls. Zero waits indefinitely.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout).filter(|t| !t.is_zero());
    }

    /// Set the wait bound in milliseconds. Zero waits indefinitely.
    pub fn set_timeout_ms(&self, millis: u64) {
        self.set_timeout(Duration::from_millis(millis));
    }

    /// Remove the wait bound.
    pub fn clear_timeout(&self) {
        *self.timeout.lock() = None;
    }

    /// Current wait bound.
    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// True iff the session is open.
    pub fn is_connected(&self) -> bool {
        self.link.lock().session.is_open()
    }

    /// Current session state.
    pub fn connection_state(&self) -> SessionState {
        self.link.lock().session.state()
    }

    /// Server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.link.lock().session.peer()
    }

    /// Block until no call is outstanding.
    pub fn wait_all_responses(&self) {
        let correlator = self.link.lock().correlator.clone();
        correlator.wait_idle();
    }

    /// Close the connection after flushing queued writes. Outstanding calls
    /// resolve with [`RpcError::NotConnected`].
    pub fn close(&self) {
        self.closed_locally.store(true, Ordering::SeqCst);
        self.link.lock().session.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.link.get_mut().retire();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Open a connection and start its session on `handle`.
fn open_link(handle: &Handle, host: &str, port: u16, config: &ClientConfig, id: SessionId) -> Result<Link> {
    let attempted_at = Instant::now();
    let stream = connect_stream(host, port, config.connect_timeout)?;
    let peer = stream.peer_addr()?;
    let stream = {
        let _guard = handle.enter();
        tokio::net::TcpStream::from_std(stream)?
    };
    configure_stream(&stream, config.nodelay)?;

    let correlator = Arc::new(Correlator::new());
    let role = Arc::new(ClientRole {
        correlator: correlator.clone(),
    });
    let session = Session::spawn(handle, stream, id, peer, role, config.session_config());

    tracing::info!(%peer, session = id, "Connected");
    Ok(Link {
        session,
        correlator,
        attempted_at,
    })
}

/// Pending result of [`Client::async_call`].
///
/// Dropping the handle abandons the call locally; the server still runs it.
pub struct CallHandle<R> {
    id: u32,
    token: u64,
    rx: flume::Receiver<Resolution>,
    timeout: Option<(Instant, Duration)>,
    correlator: Arc<Correlator>,
    /// Runtime whose timer bounds [`CallHandle::response`].
    runtime: Handle,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallHandle<R> {
    /// Message id of the call.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once the call has resolved.
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Block until the call resolves.
    pub fn wait(self) -> Result<R> {
        let resolution = match self.timeout {
            Some((deadline, after)) => match self.rx.recv_deadline(deadline) {
                Ok(resolution) => resolution,
                Err(flume::RecvTimeoutError::Timeout) => self.expired(after),
                Err(flume::RecvTimeoutError::Disconnected) => Err(RpcError::NotConnected),
            },
            None => self.rx.recv().unwrap_or(Err(RpcError::NotConnected)),
        };
        decode_result(resolution)
    }

    /// Wait for the call without blocking the thread.
    ///
    /// Works under any executor; the wait bound is timed by the client's
    /// own runtime.
    pub async fn response(self) -> Result<R> {
        let resolution = match self.timeout {
            Some((deadline, after)) => {
                let expiry = {
                    let _guard = self.runtime.enter();
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
                };
                tokio::select! {
                    biased;
                    received = self.rx.recv_async() => received.unwrap_or(Err(RpcError::NotConnected)),
                    _ = expiry => self.expired(after),
                }
            }
            None => self
                .rx
                .recv_async()
                .await
                .unwrap_or(Err(RpcError::NotConnected)),
        };
        decode_result(resolution)
    }

    fn expired(&self, after: Duration) -> Resolution {
        if self.correlator.expire(self.id, self.token) {
            return Err(RpcError::Timeout { id: self.id, after });
        }
        // Resolved while the timer fired.
        self.rx.try_recv().unwrap_or(Err(RpcError::NotConnected))
    }
}

impl<R> Drop for CallHandle<R> {
    fn drop(&mut self) {
        self.correlator.abandon(self.id, self.token);
    }
}

fn decode_result<R: DeserializeOwned>(resolution: Resolution) -> Result<R> {
    MsgPackCodec::from_value(&resolution?)
}
