//! Session table: in-flight requests keyed by message id.
//!
//! Insertion and the outstanding-count latch move together under one lock,
//! so a concurrent [`SessionTable::drain`] can never miss a request that is
//! registered but not yet counted. An id may have at most one live entry;
//! re-registering a live id fails instead of overwriting.
//!
//! Entries leave the table through [`SessionTable::take`] only, so a
//! response handler is dispatched at most once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rmpv::Value;
use tokio::sync::{oneshot, Notify};

use crate::error::{Result, RpcError};

/// Completion side of one pending call.
pub(crate) type Responder = oneshot::Sender<Result<Value>>;

/// One pending call.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub(crate) method: String,
    pub(crate) started: Instant,
    pub(crate) responder: Responder,
}

impl PendingCall {
    pub(crate) fn new(method: impl Into<String>, responder: Responder) -> Self {
        Self {
            method: method.into(),
            started: Instant::now(),
            responder,
        }
    }

    /// Deliver the outcome. A caller that stopped waiting is not an error.
    pub(crate) fn resolve(self, outcome: Result<Value>) {
        tracing::trace!(
            method = %self.method,
            elapsed = ?self.started.elapsed(),
            ok = outcome.is_ok(),
            "call resolved"
        );
        let _ = self.responder.send(outcome);
    }
}

#[derive(Default)]
struct Sessions {
    calls: HashMap<u32, PendingCall>,
    /// Latch: pending calls not yet resolved.
    outstanding: usize,
    next_id: u32,
}

/// Concurrent map from message id to pending call.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Sessions>,
    /// Signalled for blocking drains when the latch reaches zero.
    idle: Condvar,
    /// Signalled for async drains when the latch reaches zero.
    drained: Notify,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls currently pending.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().calls.contains_key(&id)
    }

    /// Next id from the wrapping counter that is not currently live.
    ///
    /// The id is not reserved; the following [`insert`](Self::insert) may
    /// still fail if another caller registered it first.
    pub fn next_free_id(&self) -> u32 {
        let mut sessions = self.inner.lock();
        loop {
            let id = sessions.next_id;
            sessions.next_id = sessions.next_id.wrapping_add(1);
            if !sessions.calls.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a pending call and count it, in one step.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `id` is already live. The rejected call is
    /// dropped, so its waiter observes the failure too.
    pub(crate) fn insert(&self, id: u32, call: PendingCall) -> Result<()> {
        let mut sessions = self.inner.lock();
        if sessions.calls.contains_key(&id) {
            return Err(RpcError::invalid(format!(
                "message id {} is already pending",
                id
            )));
        }
        sessions.calls.insert(id, call);
        sessions.outstanding += 1;
        Ok(())
    }

    /// Remove a pending call and release its latch slot.
    pub(crate) fn take(&self, id: u32) -> Option<PendingCall> {
        self.take_if(id, |_| true)
    }

    /// Like [`take`](Self::take), but only when `predicate` accepts the
    /// entry currently registered under `id`.
    pub(crate) fn take_if(
        &self,
        id: u32,
        predicate: impl FnOnce(&PendingCall) -> bool,
    ) -> Option<PendingCall> {
        let mut sessions = self.inner.lock();
        if !sessions.calls.get(&id).is_some_and(predicate) {
            return None;
        }
        let call = sessions.calls.remove(&id)?;
        sessions.outstanding -= 1;
        if sessions.outstanding == 0 {
            self.idle.notify_all();
            self.drained.notify_waiters();
        }
        Some(call)
    }

    /// Remove every pending call.
    pub(crate) fn take_all(&self) -> Vec<(u32, PendingCall)> {
        let mut sessions = self.inner.lock();
        let calls: Vec<_> = sessions.calls.drain().collect();
        sessions.outstanding = 0;
        self.idle.notify_all();
        self.drained.notify_waiters();
        calls
    }

    /// Fail every pending call with a copy of `error`.
    pub(crate) fn fail_all(&self, error: &RpcError) -> usize {
        let calls = self.take_all();
        let count = calls.len();
        for (_, call) in calls {
            call.resolve(Err(error.duplicate()));
        }
        count
    }

    /// Wait until no call is pending.
    ///
    /// # Errors
    ///
    /// `Timeout` if calls are still pending after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RpcError::Timeout {
                    operation: "drain",
                    elapsed: timeout,
                });
            }
        }
    }

    /// Blocking variant of [`drain`](Self::drain). Must not be called from
    /// inside an async task.
    pub fn drain_blocking(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut sessions = self.inner.lock();
        while sessions.outstanding > 0 {
            if self.idle.wait_until(&mut sessions, deadline).timed_out() && sessions.outstanding > 0
            {
                return Err(RpcError::Timeout {
                    operation: "drain",
                    elapsed: timeout,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pending(method: &str) -> (PendingCall, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (PendingCall::new(method, tx), rx)
    }

    #[test]
    fn test_insert_and_take() {
        let table = SessionTable::new();
        let (call, mut rx) = pending("Echo");
        table.insert(7, call).unwrap();
        assert_eq!(table.outstanding(), 1);
        assert!(table.contains(7));

        let call = table.take(7).unwrap();
        assert_eq!(call.method, "Echo");
        assert_eq!(table.outstanding(), 0);
        call.resolve(Ok(Value::from("hi")));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from("hi"));

        // Second take finds nothing: dispatch happens once.
        assert!(table.take(7).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = SessionTable::new();
        let (first, _rx1) = pending("a");
        let (second, mut rx2) = pending("b");
        table.insert(1, first).unwrap();
        assert!(matches!(
            table.insert(1, second),
            Err(RpcError::InvalidArgument(_))
        ));
        assert_eq!(table.outstanding(), 1);
        assert_eq!(table.take(1).unwrap().method, "a");
        // The rejected call's waiter sees the sender dropped.
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_take_if_leaves_rejected_entry() {
        let table = SessionTable::new();
        let (call, _rx) = pending("fresh");
        table.insert(3, call).unwrap();

        assert!(table
            .take_if(3, |call| call.responder.is_closed())
            .is_none());
        assert!(table.contains(3));
        assert_eq!(table.outstanding(), 1);

        assert!(table.take_if(3, |call| call.method == "fresh").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_next_free_id_skips_live() {
        let table = SessionTable::new();
        let (call, _rx) = pending("x");
        table.insert(0, call).unwrap();
        assert_eq!(table.next_free_id(), 1);
        assert_eq!(table.next_free_id(), 2);
    }

    #[test]
    fn test_next_free_id_wraps() {
        let table = SessionTable::new();
        table.inner.lock().next_id = u32::MAX;
        assert_eq!(table.next_free_id(), u32::MAX);
        assert_eq!(table.next_free_id(), 0);
    }

    #[test]
    fn test_fail_all() {
        let table = SessionTable::new();
        let mut receivers = Vec::new();
        for id in 0..3 {
            let (call, rx) = pending("m");
            table.insert(id, call).unwrap();
            receivers.push(rx);
        }
        assert_eq!(table.fail_all(&RpcError::ConnectionClosed), 3);
        assert!(table.is_empty());
        for mut rx in receivers {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(RpcError::ConnectionClosed)
            ));
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_all() {
        let table = Arc::new(SessionTable::new());
        for id in 0..4 {
            let (call, _rx) = pending("m");
            table.insert(id, call).unwrap();
        }

        let resolver = table.clone();
        tokio::spawn(async move {
            for id in 0..4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                // Never empty before the last take.
                assert!(!resolver.is_empty());
                resolver.take(id);
            }
        });

        table.drain(Duration::from_secs(5)).await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let table = SessionTable::new();
        let (call, _rx) = pending("m");
        table.insert(1, call).unwrap();

        let err = table.drain(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { operation: "drain", .. }));
        assert_eq!(table.outstanding(), 1);
    }

    #[test]
    fn test_drain_blocking() {
        let table = Arc::new(SessionTable::new());
        let (call, _rx) = pending("m");
        table.insert(9, call).unwrap();

        let resolver = table.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.take(9);
        });

        table.drain_blocking(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        let (call, _rx) = pending("m");
        table.insert(10, call).unwrap();
        assert!(table.drain_blocking(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_empty_drain_returns_immediately() {
        let table = SessionTable::new();
        table.drain_blocking(Duration::from_millis(1)).unwrap();
    }
}
