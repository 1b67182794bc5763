//! Stream registry: method name → active subscriptions.
//!
//! Each subscription owns a bounded FIFO queue. The dispatch loop never
//! waits on a subscriber: when a queue is full the oldest payload is dropped
//! and counted, so a slow consumer loses history instead of stalling every
//! other caller on the connection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::RpcError;

struct SubState {
    queue: VecDeque<Bytes>,
    closed: Option<RpcError>,
    dropped: u64,
}

struct SubShared {
    id: u64,
    method: String,
    capacity: usize,
    state: Mutex<SubState>,
    notify: Notify,
}

impl SubShared {
    /// Enqueue without blocking. Returns `false` if the subscription is closed.
    fn push(&self, payload: Bytes) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed.is_some() {
                return false;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                tracing::warn!(
                    method = %self.method,
                    subscription = self.id,
                    dropped = state.dropped,
                    "subscription queue full, dropping oldest notification"
                );
            }
            state.queue.push_back(payload);
        }
        self.notify.notify_waiters();
        true
    }

    /// Mark closed with `cause`. Queued payloads are discarded.
    fn close(&self, cause: RpcError) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(cause);
            state.queue.clear();
        }
        self.notify.notify_waiters();
        true
    }
}

#[derive(Default)]
struct RegistryInner {
    subs: HashMap<String, Vec<Arc<SubShared>>>,
    next_id: u64,
    closed: Option<RpcError>,
}

/// Thread-safe registry of subscriptions, shared by the connection and its
/// subscription handles.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    capacity: usize,
}

impl StreamRegistry {
    /// Create a registry whose subscriptions buffer up to `capacity` payloads.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscription for `method`.
    ///
    /// After `close_all` the returned subscription is already closed with
    /// the registry's closing cause.
    pub fn add(&self, method: &str) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let shared = Arc::new(SubShared {
            id: inner.next_id,
            method: method.to_string(),
            capacity: self.capacity,
            state: Mutex::new(SubState {
                queue: VecDeque::new(),
                closed: inner.closed.clone(),
                dropped: 0,
            }),
            notify: Notify::new(),
        });
        if inner.closed.is_none() {
            inner
                .subs
                .entry(method.to_string())
                .or_default()
                .push(Arc::clone(&shared));
        }
        Subscription {
            shared,
            registry: self.clone(),
        }
    }

    /// Deregister subscription `id` from `method`, leaving its siblings alone.
    pub fn remove(&self, method: &str, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.subs.get_mut(method) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.subs.remove(method);
        }
        removed
    }

    /// Deliver `payload` to every subscription for `method`, in registration
    /// order. Returns how many subscriptions accepted it.
    pub fn fanout(&self, method: &str, payload: Bytes) -> usize {
        let targets = match self.inner.lock().unwrap().subs.get(method) {
            Some(list) => list.clone(),
            None => return 0,
        };
        targets
            .iter()
            .filter(|s| s.push(payload.clone()))
            .count()
    }

    /// Close every subscription with `cause`; later `add`s start closed.
    pub fn close_all(&self, cause: &RpcError) -> usize {
        let subs = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_none() {
                inner.closed = Some(cause.clone());
            }
            std::mem::take(&mut inner.subs)
        };
        subs.into_values()
            .flatten()
            .filter(|s| s.close(cause.clone()))
            .count()
    }

    /// Total number of active subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().subs.values().map(Vec::len).sum()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to one subscription.
///
/// `recv` and `close` both take `&self`, so one task may close the handle
/// while another is blocked receiving. Dropping the handle closes it.
pub struct Subscription {
    shared: Arc<SubShared>,
    registry: StreamRegistry,
}

impl Subscription {
    /// The method name this subscription listens to.
    pub fn method(&self) -> &str {
        &self.shared.method
    }

    /// Wait for the next notification payload.
    ///
    /// Returns [`RpcError::StreamClosed`] after `close`, or the connection's
    /// closing cause after teardown. Cancel-safe: dropping the future loses
    /// nothing.
    pub async fn recv(&self) -> Result<Bytes, RpcError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(cause) = &state.closed {
                    return Err(cause.clone());
                }
                if let Some(payload) = state.queue.pop_front() {
                    return Ok(payload);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv): `None` if nothing is queued.
    pub fn try_recv(&self) -> Option<Result<Bytes, RpcError>> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(cause) = &state.closed {
            return Some(Err(cause.clone()));
        }
        state.queue.pop_front().map(Ok)
    }

    /// Resolve once a payload is buffered, without consuming it.
    pub async fn ready(&self) -> Result<(), RpcError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let state = self.shared.state.lock().unwrap();
                if let Some(cause) = &state.closed {
                    return Err(cause.clone());
                }
                if !state.queue.is_empty() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Number of notifications discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().unwrap().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed.is_some()
    }

    /// Deregister and unblock any waiter with [`RpcError::StreamClosed`].
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.shared.close(RpcError::StreamClosed) {
            self.registry.remove(&self.shared.method, self.shared.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn fanout_reaches_only_matching_method() {
        let reg = StreamRegistry::new(8);
        let hello = reg.add("test.Hello");
        let world = reg.add("test.World");

        assert_eq!(reg.fanout("test.Hello", b("1")), 1);
        assert_eq!(reg.fanout("test.Unknown", b("2")), 0);

        assert_eq!(hello.recv().await.unwrap(), b("1"));
        assert!(world.try_recv().is_none());
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy_in_order() {
        let reg = StreamRegistry::new(8);
        let a = reg.add("m");
        let c = reg.add("m");
        for p in ["1", "2", "3"] {
            assert_eq!(reg.fanout("m", b(p)), 2);
        }
        for sub in [&a, &c] {
            for p in ["1", "2", "3"] {
                assert_eq!(sub.recv().await.unwrap(), b(p));
            }
        }
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let reg = StreamRegistry::new(2);
        let sub = reg.add("m");
        for p in ["1", "2", "3", "4"] {
            reg.fanout("m", b(p));
        }
        assert_eq!(sub.dropped(), 2);
        assert_eq!(sub.recv().await.unwrap(), b("3"));
        assert_eq!(sub.recv().await.unwrap(), b("4"));
    }

    #[tokio::test]
    async fn close_unblocks_waiter_and_is_idempotent() {
        let reg = StreamRegistry::new(8);
        let sub = Arc::new(reg.add("m"));
        let waiter = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        sub.close();
        sub.close();
        assert_eq!(waiter.await.unwrap(), Err(RpcError::StreamClosed));
        assert_eq!(sub.recv().await, Err(RpcError::StreamClosed));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn closing_one_leaves_siblings() {
        let reg = StreamRegistry::new(8);
        let a = reg.add("m");
        let c = reg.add("m");
        a.close();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.fanout("m", b("x")), 1);
        assert_eq!(c.recv().await.unwrap(), b("x"));
    }

    #[tokio::test]
    async fn close_all_discards_queue_and_sticks() {
        let reg = StreamRegistry::new(8);
        let sub = reg.add("m");
        reg.fanout("m", b("queued"));

        assert_eq!(reg.close_all(&RpcError::ConnClosing), 1);
        assert_eq!(sub.recv().await, Err(RpcError::ConnClosing));
        assert_eq!(reg.fanout("m", b("late")), 0);

        let late = reg.add("m");
        assert!(late.is_closed());
        assert_eq!(late.recv().await, Err(RpcError::ConnClosing));
    }

    #[tokio::test]
    async fn ready_does_not_consume() {
        let reg = StreamRegistry::new(8);
        let sub = reg.add("m");
        reg.fanout("m", b("x"));
        sub.ready().await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), b("x"));
    }

    #[test]
    fn dropping_handle_deregisters() {
        let reg = StreamRegistry::new(8);
        let sub = reg.add("m");
        assert_eq!(reg.len(), 1);
        drop(sub);
        assert!(reg.is_empty());
    }
}
