//! Pending-call registry: call id → single-use delivery slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::RpcError;

type Outcome = Result<Bytes, RpcError>;

#[derive(Default)]
struct PendingInner {
    calls: HashMap<u64, oneshot::Sender<Outcome>>,
    /// Set once by `drain`; later registrations are refused with it.
    closed: Option<RpcError>,
}

/// Thread-safe table of in-flight calls.
///
/// Every entry is removed exactly once: by `resolve`, by `drain`, or by the
/// [`PendingCall`] guard when its waiter gives up. Whoever takes the entry
/// out of the map first delivers; everyone else sees it gone.
#[derive(Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<PendingInner>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the waiter's handle.
    ///
    /// Fails with the closing cause once the registry has been drained.
    pub fn register(&self, id: u64) -> Result<PendingCall, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        let prev = inner.calls.insert(id, tx);
        debug_assert!(prev.is_none(), "call id {id} registered twice");
        Ok(PendingCall {
            id,
            rx,
            registry: self.clone(),
        })
    }

    /// Deliver `outcome` to the waiter for `id`.
    ///
    /// Returns `false` if no such call is pending (stale or unknown reply).
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let tx = self.inner.lock().unwrap().calls.remove(&id);
        match tx {
            Some(tx) => {
                // The waiter may have just been cancelled; that is not an error.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without delivering anything.
    pub fn remove(&self, id: u64) -> bool {
        self.inner.lock().unwrap().calls.remove(&id).is_some()
    }

    /// Resolve every pending call with `cause` and refuse new registrations.
    ///
    /// Returns the number of calls released.
    pub fn drain(&self, cause: &RpcError) -> usize {
        let calls = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_none() {
                inner.closed = Some(cause.clone());
            }
            std::mem::take(&mut inner.calls)
        };
        let n = calls.len();
        for (_, tx) in calls {
            let _ = tx.send(Err(cause.clone()));
        }
        n
    }

    /// Number of calls awaiting a reply.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    /// Returns `true` if no call is awaiting a reply.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The waiting side of one pending call.
///
/// Dropping it before a reply arrives deregisters the call, so a cancelled
/// or timed-out caller never leaves an entry behind.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    registry: PendingCalls,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply or the closing cause.
    pub async fn wait(mut self) -> Outcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Sender gone without a value: the registry itself was dropped.
            Err(_) => Err(RpcError::ConnClosing),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
