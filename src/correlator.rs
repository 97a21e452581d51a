//! Client-side bookkeeping of outstanding calls.
//!
//! Each call gets a message id from a wrapping 32-bit counter and a
//! one-shot slot that is filled exactly once: by the matching Response, by
//! a timeout, or by the session closing. Entries are removed when they are
//! resolved, so a Response arriving after its call timed out finds nothing
//! and is dropped.
//!
//! Every entry also carries a private token. Expiry and abandonment name
//! the token as well as the id, so they can never remove a newer call that
//! happens to reuse the id after wrap-around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use rmpv::Value;

use crate::error::{RemoteError, Result, RpcError};
use crate::protocol::Response;
use crate::session::CloseReason;

/// What a pending call resolves to, before typed decoding.
pub type Resolution = Result<Value>;

struct PendingCall {
    token: u64,
    tx: flume::Sender<Resolution>,
}

/// Receiving side of one registered call.
pub struct Ticket {
    /// Message id to put on the wire.
    pub id: u32,
    /// Private token identifying this registration.
    pub token: u64,
    /// Filled once with the call's resolution.
    pub rx: flume::Receiver<Resolution>,
}

/// Maps outstanding message ids to their resolution slots.
pub struct Correlator {
    pending: Mutex<HashMap<u32, PendingCall>>,
    idle: Condvar,
    next_id: AtomicU32,
    next_token: AtomicU64,
}

impl Correlator {
    /// Create an empty correlator. Ids start at 0.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            next_id: AtomicU32::new(0),
            next_token: AtomicU64::new(0),
        }
    }

    /// Allocate an id and register a pending call under it.
    ///
    /// # Errors
    ///
    /// [`RpcError::IdExhausted`] if the counter wrapped onto an id that is
    /// still outstanding.
    pub fn register(&self) -> Result<Ticket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();

        if pending.contains_key(&id) {
            return Err(RpcError::IdExhausted(id));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(1);
        pending.insert(id, PendingCall { token, tx });

        Ok(Ticket { id, token, rx })
    }

    /// Resolve the call matching `response.id`.
    ///
    /// Returns false if no call is waiting for that id.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(call) = self.remove(response.id, None) else {
            tracing::warn!(id = response.id, "Response for unknown call, dropping");
            return false;
        };

        let resolution = response
            .outcome
            .map_err(|error| RpcError::Remote(RemoteError::from_value(error)));
        let _ = call.tx.send(resolution);
        true
    }

    /// Remove a call whose wait bound elapsed.
    ///
    /// Returns true if the call was still outstanding; the caller reports
    /// the timeout. Returns false if it had already been resolved.
    pub fn expire(&self, id: u32, token: u64) -> bool {
        let expired = self.remove(id, Some(token)).is_some();
        if expired {
            tracing::debug!(id, "Call timed out");
        }
        expired
    }

    /// Forget a call nobody is waiting for any more.
    pub fn abandon(&self, id: u32, token: u64) {
        self.remove(id, Some(token));
    }

    /// Resolve every outstanding call because the session closed.
    pub fn fail_all(&self, reason: CloseReason) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let drained = pending.drain().map(|(_, call)| call).collect();
            self.idle.notify_all();
            drained
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), ?reason, "Failing outstanding calls");
        }

        for call in drained {
            let error = match reason {
                CloseReason::Protocol => {
                    RpcError::Protocol("session closed after a malformed envelope".to_string())
                }
                _ => RpcError::NotConnected,
            };
            let _ = call.tx.send(Err(error));
        }
    }

    /// Number of calls still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Block until no call is outstanding.
    pub fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while !pending.is_empty() {
            self.idle.wait(&mut pending);
        }
    }

    fn remove(&self, id: u32, token: Option<u64>) -> Option<PendingCall> {
        let mut pending = self.pending.lock();

        if let Some(token) = token {
            if pending.get(&id).map(|call| call.token) != Some(token) {
                return None;
            }
        }

        let call = pending.remove(&id);
        if pending.is_empty() {
            self.idle.notify_all();
        }
        call
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ids_are_distinct() {
        let correlator = Correlator::new();
        let mut seen = HashSet::new();
        let mut tickets = Vec::new();

        for _ in 0..1000 {
            let ticket = correlator.register().unwrap();
            assert!(seen.insert(ticket.id));
            tickets.push(ticket);
        }

        assert_eq!(correlator.outstanding(), 1000);
    }

    #[test]
    fn test_resolve_delivers_result() {
        let correlator = Correlator::new();
        let ticket = correlator.register().unwrap();

        assert!(correlator.resolve(Response::ok(ticket.id, Value::from(7))));

        assert_eq!(ticket.rx.recv().unwrap().unwrap(), Value::from(7));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn test_resolve_delivers_remote_error() {
        let correlator = Correlator::new();
        let ticket = correlator.register().unwrap();

        correlator.resolve(Response::err(ticket.id, Value::from("bad input")));

        let err = ticket.rx.recv().unwrap().unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Application));
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let correlator = Correlator::new();
        let ticket = correlator.register().unwrap();

        assert!(!correlator.resolve(Response::ok(ticket.id + 100, Value::Nil)));
        assert_eq!(correlator.outstanding(), 1);
        assert!(ticket.rx.is_empty());
    }

    #[test]
    fn test_late_response_after_expiry() {
        let correlator = Correlator::new();
        let slow = correlator.register().unwrap();
        let next = correlator.register().unwrap();

        assert!(correlator.expire(slow.id, slow.token));
        assert!(!correlator.expire(slow.id, slow.token));

        // Late answer for the expired call must not land anywhere.
        assert!(!correlator.resolve(Response::ok(slow.id, Value::from("late"))));
        assert!(next.rx.is_empty());

        assert!(correlator.resolve(Response::ok(next.id, Value::from("on time"))));
        assert_eq!(next.rx.recv().unwrap().unwrap(), Value::from("on time"));
    }

    #[test]
    fn test_expire_after_resolve_is_noop() {
        let correlator = Correlator::new();
        let ticket = correlator.register().unwrap();

        correlator.resolve(Response::ok(ticket.id, Value::from(1)));
        assert!(!correlator.expire(ticket.id, ticket.token));
        assert!(ticket.rx.recv().unwrap().is_ok());
    }

    #[test]
    fn test_stale_token_does_not_touch_reused_id() {
        let correlator = Correlator::new();
        let old = correlator.register().unwrap();
        correlator.abandon(old.id, old.token);

        correlator.next_id.store(old.id, Ordering::Relaxed);
        let reused = correlator.register().unwrap();
        assert_eq!(reused.id, old.id);

        assert!(!correlator.expire(old.id, old.token));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn test_id_exhausted() {
        let correlator = Correlator::new();
        let first = correlator.register().unwrap();

        correlator.next_id.store(first.id, Ordering::Relaxed);
        let err = correlator.register().err().unwrap();
        assert!(matches!(err, RpcError::IdExhausted(id) if id == first.id));
    }

    #[test]
    fn test_id_wraps() {
        let correlator = Correlator::new();
        correlator.next_id.store(u32::MAX, Ordering::Relaxed);

        assert_eq!(correlator.register().unwrap().id, u32::MAX);
        assert_eq!(correlator.register().unwrap().id, 0);
    }

    #[test]
    fn test_fail_all() {
        let correlator = Correlator::new();
        let a = correlator.register().unwrap();
        let b = correlator.register().unwrap();

        correlator.fail_all(CloseReason::PeerClosed);

        assert!(matches!(a.rx.recv().unwrap(), Err(RpcError::NotConnected)));
        assert!(matches!(b.rx.recv().unwrap(), Err(RpcError::NotConnected)));
        assert_eq!(correlator.outstanding(), 0);

        let c = correlator.register().unwrap();
        correlator.fail_all(CloseReason::Protocol);
        assert!(matches!(c.rx.recv().unwrap(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_wait_idle() {
        let correlator = Arc::new(Correlator::new());
        let ticket = correlator.register().unwrap();

        let resolver = {
            let correlator = correlator.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                correlator.resolve(Response::ok(ticket.id, Value::Nil));
            })
        };

        correlator.wait_idle();
        assert_eq!(correlator.outstanding(), 0);
        resolver.join().unwrap();
    }
}
