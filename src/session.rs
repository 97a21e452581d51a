//! One live connection: read loop, write queue and lifecycle.
//!
//! A [`Session`] is a cheap handle to shared state. The socket itself is
//! owned by a single task that joins a read loop (decode envelopes, hand
//! them to the [`SessionRole`]) with the [`writer_loop`]. When both finish
//! the role's [`SessionRole::on_closed`] runs exactly once.
//!
//! The read loop waits for each envelope to be taken before reading more,
//! so a role that cannot keep up leaves data in the kernel buffers and the
//! peer sees TCP backpressure.
//!
//! ```text
//!            Open ──close()──► Closing ──writer drained──► Closed
//!              │                  │
//!              └──── I/O or protocol error ─────────────► Closed
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Result, RpcError};
use crate::protocol::{Envelope, EnvelopeBuffer};
use crate::writer::{self, writer_loop, WriterConfig, WriterHandle, WriterQueue};

/// Identifier of a session, unique within one server or client.
pub type SessionId = u64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Reading and writing.
    Open = 0,
    /// Flushing queued writes; new writes are refused.
    Closing = 1,
    /// Connection released.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// The peer closed its end of the stream.
    PeerClosed,
    /// The peer sent a malformed envelope.
    Protocol,
    /// A socket read or write failed.
    Io,
    /// A bound function panicked with exception suppression off.
    HandlerPanicked,
    /// The peer stopped reading and the write queue stayed full.
    Backpressure,
    /// The owning server was stopped.
    Stopped,
}

/// What a session does with the envelopes it decodes.
pub trait SessionRole: Send + Sync + 'static {
    /// Short name recorded on the session's tracing span.
    fn name(&self) -> &'static str;

    /// Handle one decoded envelope. Called in wire order from the read loop,
    /// which reads nothing further until the returned future completes.
    fn on_envelope(&self, session: &Session, envelope: Envelope) -> impl Future<Output = ()> + Send;

    /// Called once after the connection has been released.
    fn on_closed(&self, session: &Session, reason: CloseReason);
}

/// Tuning knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest envelope accepted before the stream is rejected.
    pub max_message_size: usize,
    /// Bytes reserved in the read buffer before each read.
    pub read_buffer_size: usize,
    /// Write queue bounds.
    pub writer: WriterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: crate::protocol::DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: crate::protocol::DEFAULT_BUFFER_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

struct Shared {
    id: SessionId,
    peer: SocketAddr,
    state: AtomicU8,
    reason: Mutex<Option<CloseReason>>,
    writer: WriterHandle,
    cancel: CancellationToken,
}

/// Handle to one connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("peer", &self.peer())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Start serving `stream` on `runtime` and return a handle to it.
    pub fn spawn<S, R>(
        runtime: &Handle,
        stream: S,
        id: SessionId,
        peer: SocketAddr,
        role: Arc<R>,
        config: SessionConfig,
    ) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: SessionRole,
    {
        let (handle, queue) = writer::channel(&config.writer);
        let session = Session {
            shared: Arc::new(Shared {
                id,
                peer,
                state: AtomicU8::new(SessionState::Open as u8),
                reason: Mutex::new(None),
                writer: handle,
                cancel: CancellationToken::new(),
            }),
        };

        let span = tracing::info_span!("rpc.session", id, peer = %peer, role = role.name());
        runtime.spawn(run(session.clone(), stream, queue, role, config).instrument(span));

        session
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True iff the state is [`SessionState::Open`].
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue an encoded envelope for writing.
    ///
    /// Waits for room while the write queue is full.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotConnected`] unless the session is open
    /// - [`RpcError::BackpressureTimeout`] if the queue stayed full
    pub fn enqueue(&self, bytes: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::NotConnected);
        }
        self.shared.writer.send(bytes)
    }

    /// Encode and queue an envelope.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::NotConnected);
        }
        let bytes = envelope.into_bytes()?;
        self.enqueue(Bytes::from(bytes))
    }

    /// Begin a graceful close: refuse new writes, flush queued ones, then
    /// release the connection. No-op unless the session is open.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    fn close_with(&self, reason: CloseReason) {
        let moved = self.shared.state.compare_exchange(
            SessionState::Open as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if moved.is_ok() {
            self.record(reason);
            tracing::debug!(session = self.id(), ?reason, "Closing session");
            self.shared.writer.close();
        }
    }

    /// Begin a graceful close recording `reason` instead of a local close.
    pub(crate) fn close_because(&self, reason: CloseReason) {
        self.close_with(reason);
    }

    /// Drop the connection now without flushing.
    pub(crate) fn abort(&self, reason: CloseReason) {
        self.record(reason);
        self.mark_closed();
    }

    /// Wait until the connection has been released.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    fn record(&self, reason: CloseReason) {
        let mut slot = self.shared.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn mark_closed(&self) {
        self.shared
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.shared.cancel.cancel();
    }

    fn reason(&self) -> CloseReason {
        self.shared.reason.lock().unwrap_or(CloseReason::Local)
    }
}

async fn run<S, R>(
    session: Session,
    stream: S,
    queue: WriterQueue,
    role: Arc<R>,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: SessionRole,
{
    tracing::debug!("Session opened");
    let (reader, writer) = tokio::io::split(stream);

    tokio::join!(
        read_loop(&session, reader, role.as_ref(), config),
        write_loop(&session, queue, writer),
    );

    session.mark_closed();
    let reason = session.reason();
    tracing::debug!(?reason, "Session closed");
    role.on_closed(&session, reason);
}

async fn write_loop<W>(session: &Session, queue: WriterQueue, writer: W)
where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        _ = session.shared.cancel.cancelled() => Ok(()),
        result = writer_loop(queue, writer) => result,
    };

    match result {
        Ok(()) => session.mark_closed(),
        Err(e) => {
            tracing::warn!(error = %e, "Write failed");
            session.abort(CloseReason::Io);
        }
    }
}

async fn read_loop<Rd, R>(session: &Session, mut reader: Rd, role: &R, config: SessionConfig)
where
    Rd: AsyncRead + Unpin,
    R: SessionRole,
{
    let mut buffer =
        EnvelopeBuffer::with_capacity_and_max_message_size(config.read_buffer_size, config.max_message_size);
    let cancel = session.shared.cancel.clone();

    loop {
        buffer.buffer_mut().reserve(config.read_buffer_size);

        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(buffer.buffer_mut()) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Peer closed the connection");
                session.close_with(CloseReason::PeerClosed);
                return;
            }
            Ok(_) => match buffer.drain() {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = role.on_envelope(session, envelope) => {}
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Malformed stream, closing session");
                    session.abort(CloseReason::Protocol);
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Read failed");
                session.abort(CloseReason::Io);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{Call, Notification, Response};
    use rmpv::Value;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    /// Echoes every Call back as a Response and records what it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
        closed: Mutex<Vec<CloseReason>>,
    }

    impl SessionRole for Recorder {
        fn name(&self) -> &'static str {
            "test"
        }

        fn on_envelope(&self, session: &Session, envelope: Envelope) -> impl Future<Output = ()> + Send {
            if let Envelope::Call(call) = &envelope {
                let response = Response::ok(call.id, Value::from(call.method.as_str()));
                session.send(response.into()).unwrap();
            }
            self.seen.lock().push(envelope);
            std::future::ready(())
        }

        fn on_closed(&self, _session: &Session, reason: CloseReason) {
            self.closed.lock().push(reason);
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn start(stream: DuplexStream) -> (Session, Arc<Recorder>) {
        let role = Arc::new(Recorder::default());
        let session = Session::spawn(
            &Handle::current(),
            stream,
            1,
            peer(),
            role.clone(),
            SessionConfig::default(),
        );
        (session, role)
    }

    async fn read_envelope(stream: &mut DuplexStream) -> Envelope {
        let mut buffer = EnvelopeBuffer::new();
        loop {
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream ended before an envelope arrived");
            if let Some(envelope) = buffer.push(&chunk[..n]).unwrap().into_iter().next() {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_routes_envelopes_and_writes_replies() {
        let (local, mut remote) = duplex(4096);
        let (session, role) = start(local);

        let call = Envelope::Call(Call::new(5, "ping", vec![]));
        remote.write_all(&call.encode().unwrap()).await.unwrap();

        let reply = read_envelope(&mut remote).await;
        let Envelope::Response(response) = reply else {
            panic!("expected response");
        };
        assert_eq!(response.id, 5);
        assert_eq!(response.result(), Some(&Value::from("ping")));
        assert!(session.is_open());
        assert_eq!(role.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_split_envelope_across_reads() {
        let (local, mut remote) = duplex(4096);
        let (_session, role) = start(local);

        let bytes = Envelope::Notification(Notification::new("tick", vec![Value::from(1)]))
            .encode()
            .unwrap();
        remote.write_all(&bytes[..3]).await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(role.seen.lock().is_empty());

        remote.write_all(&bytes[3..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(role.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_then_releases() {
        let (local, mut remote) = duplex(4096);
        let (session, role) = start(local);

        session
            .send(Envelope::Notification(Notification::new("bye", vec![])))
            .unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(
            session.send(Envelope::Notification(Notification::new("late", vec![]))),
            Err(RpcError::NotConnected)
        ));

        let envelope = read_envelope(&mut remote).await;
        assert!(matches!(envelope, Envelope::Notification(n) if n.method == "bye"));

        session.closed().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*role.closed.lock(), vec![CloseReason::Local]);
    }

    #[tokio::test]
    async fn test_peer_eof_closes() {
        let (local, remote) = duplex(4096);
        let (session, role) = start(local);

        drop(remote);
        session.closed().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.state(), SessionState::Closed);
        let closed = role.closed.lock().clone();
        assert_eq!(closed.len(), 1);
        assert!(matches!(closed[0], CloseReason::PeerClosed | CloseReason::Io));
    }

    #[tokio::test]
    async fn test_protocol_error_is_fatal() {
        let (local, mut remote) = duplex(4096);
        let (session, role) = start(local);

        let garbage = MsgPackCodec::write_value(&Value::Array(vec![Value::from(7)])).unwrap();
        remote.write_all(&garbage).await.unwrap();

        session.closed().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*role.closed.lock(), vec![CloseReason::Protocol]);
    }

    /// Holds every envelope until released.
    struct Gate {
        open: Arc<tokio::sync::Notify>,
        seen: Arc<Mutex<usize>>,
    }

    impl SessionRole for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn on_envelope(&self, _session: &Session, _envelope: Envelope) -> impl Future<Output = ()> + Send {
            let open = self.open.clone();
            let seen = self.seen.clone();
            async move {
                open.notified().await;
                *seen.lock() += 1;
            }
        }

        fn on_closed(&self, _session: &Session, _reason: CloseReason) {}
    }

    #[tokio::test]
    async fn test_slow_role_stops_reading() {
        let (local, mut remote) = duplex(64);
        let open = Arc::new(tokio::sync::Notify::new());
        let seen = Arc::new(Mutex::new(0));
        let role = Arc::new(Gate {
            open: open.clone(),
            seen: seen.clone(),
        });
        let _session = Session::spawn(&Handle::current(), local, 1, peer(), role, SessionConfig::default());

        let bytes = Envelope::Notification(Notification::new("tick", vec![])).encode().unwrap();
        let mut written = 0;
        let stalled = loop {
            let write = tokio::time::timeout(Duration::from_millis(50), remote.write_all(&bytes));
            match write.await {
                Ok(result) => {
                    result.unwrap();
                    written += 1;
                }
                Err(_) => break true,
            }
            if written > 1000 {
                break false;
            }
        };
        assert!(stalled, "peer kept writing into a session that was not reading");
        assert_eq!(*seen.lock(), 0);

        open.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = duplex(4096);
        let (session, role) = start(local);

        session.close();
        session.close();
        session.closed().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close();

        assert_eq!(role.closed.lock().len(), 1);
    }
}
