//! Correlation registry (§4.3): matches asynchronous broker replies back to
//! the dispatcher task that is waiting on them.
//!
//! One `Mutex` guarding a plain `HashMap`, never held across an `.await`.
//! `begin` registers a waiter and hands back a `oneshot::Receiver`; `resolve`
//! is called from the reply-queue consumer task and wakes exactly one
//! waiter. A reply that arrives after its waiter already timed out and was
//! removed is counted and dropped silently (S4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

use crate::error::ProxyError;

pub struct CorrelationRegistry {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<Bytes>>>,
    late_replies: AtomicU64,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            late_replies: AtomicU64::new(0),
        }
    }

    /// Registers a waiter for `id` and returns the receiving half.
    pub fn begin(&self, id: Uuid) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("correlation mutex poisoned");
        waiters.insert(id, tx);
        rx
    }

    /// Called by the reply consumer when a message with `correlation_id ==
    /// id` arrives. Returns `true` if a waiter was woken, `false` if the
    /// reply was late (the waiter already timed out and deregistered).
    pub fn resolve(&self, id: Uuid, payload: Bytes) -> bool {
        let sender = {
            let mut waiters = self.waiters.lock().expect("correlation mutex poisoned");
            waiters.remove(&id)
        };
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                self.late_replies.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Removes a waiter without resolving it, e.g. after the caller gives
    /// up. Idempotent.
    pub(crate) fn forget(&self, id: &Uuid) {
        self.waiters
            .lock()
            .expect("correlation mutex poisoned")
            .remove(id);
    }

    pub fn late_reply_count(&self) -> u64 {
        self.late_replies.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().expect("correlation mutex poisoned").len()
    }

    /// Awaits a waiter already registered via [`begin`](Self::begin), bounded
    /// by `deadline`. On timeout (or if the sender was dropped) the waiter is
    /// deregistered so a subsequent late reply is counted rather than
    /// silently matched to a new, unrelated request.
    pub async fn wait_for(
        &self,
        id: Uuid,
        rx: oneshot::Receiver<Bytes>,
        deadline: Duration,
    ) -> Result<Bytes, ProxyError> {
        match timeout(deadline, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.forget(&id);
                Err(ProxyError::NotConnected)
            }
            Err(_) => {
                self.forget(&id);
                Err(ProxyError::TimeoutException)
            }
        }
    }

    /// Registers a waiter and awaits its resolution, bounded by `deadline`.
    pub async fn await_reply(&self, id: Uuid, deadline: Duration) -> Result<Bytes, ProxyError> {
        let rx = self.begin(id);
        self.wait_for(id, rx, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_matching_waiter() {
        let registry = CorrelationRegistry::new();
        let id = Uuid::new_v4();
        let registry_ref = &registry;
        let wait = async { registry_ref.await_reply(id, Duration::from_secs(5)).await };
        let resolve = async {
            // Give the waiter a chance to register before resolving.
            tokio::task::yield_now().await;
            assert!(registry_ref.resolve(id, Bytes::from_static(b"payload")));
        };
        let (result, ()) = tokio::join!(wait, resolve);
        assert_eq!(result.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn unrelated_ids_do_not_cross_talk() {
        let registry = CorrelationRegistry::new();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let rx_a = registry.begin(id_a);
        let _rx_b = registry.begin(id_b);
        assert!(registry.resolve(id_b, Bytes::from_static(b"for-b")));
        assert_eq!(registry.pending_count(), 1);
        drop(rx_a);
    }

    #[tokio::test]
    async fn timeout_deregisters_waiter_and_late_reply_is_counted() {
        let registry = CorrelationRegistry::new();
        let id = Uuid::new_v4();
        let result = registry.await_reply(id, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ProxyError::TimeoutException)));
        assert_eq!(registry.pending_count(), 0);

        let woke = registry.resolve(id, Bytes::from_static(b"too-late"));
        assert!(!woke);
        assert_eq!(registry.late_reply_count(), 1);
    }
}
