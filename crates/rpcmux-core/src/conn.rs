//! The connection engine.
//!
//! A [`Conn`] owns one duplex frame transport and multiplexes calls,
//! notifications and subscriptions over it:
//!
//! ```text
//! caller ─► call/notify ─► codec.encode ─► [writer lock] ─► socket
//! socket ─► dispatch task ─► codec.decode ─┬─► pending calls (by id)
//!                                          └─► subscriptions (by method)
//! ```
//!
//! Teardown happens exactly once. The first closing cause wins and is
//! handed to every pending call, every open subscription, and every
//! operation attempted afterwards.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::codec::{Codec, JsonCodec};
use crate::config::ConnConfig;
use crate::error::{DialError, RpcError};
use crate::pending::{PendingCall, PendingCalls};
use crate::request::{Inbound, Request, Response};
use crate::streams::{StreamRegistry, Subscription};
use crate::transport::{Dialer, FrameReader, FrameWriter, Transport};

struct Inner<C> {
    codec: Arc<C>,
    next_id: AtomicU64,
    writer: Mutex<Box<dyn FrameWriter>>,
    writer_closed: AtomicBool,
    pending: PendingCalls,
    streams: StreamRegistry,
    /// `None` while open, the closing cause afterwards.
    state: watch::Sender<Option<RpcError>>,
    config: ConnConfig,
}

impl<C: Codec> Inner<C> {
    fn cause(&self) -> Option<RpcError> {
        self.state.borrow().clone()
    }

    fn check_open(&self) -> Result<(), RpcError> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Flip to the terminal state and release every waiter.
    ///
    /// Returns `false` if the connection was already closed.
    fn shutdown(&self, cause: RpcError) -> bool {
        let mut first = false;
        self.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(cause.clone());
                first = true;
            }
            first
        });
        if !first {
            return false;
        }

        let calls = self.pending.drain(&cause);
        let subs = self.streams.close_all(&cause);
        if cause.is_closing() {
            tracing::info!(calls, subs, "connection closed");
        } else {
            tracing::warn!(error = %cause, calls, subs, "connection closed");
        }
        true
    }

    /// Resolves with the closing cause once the connection has closed.
    async fn closed(&self) -> RpcError {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(cause) = current {
                return cause;
            }
            if rx.changed().await.is_err() {
                return RpcError::ConnClosing;
            }
        }
    }

    /// Close the socket once. `writer_closed` is only set under the writer
    /// lock; a close that timed out waiting for the lock leaves it unset.
    async fn close_writer(&self) {
        let close = async {
            let mut writer = self.writer.lock().await;
            if self.writer_closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            writer.close().await
        };
        match tokio::time::timeout(self.config.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "error closing socket"),
            Err(_) => tracing::warn!(
                timeout_ms = self.config.close_timeout.as_millis() as u64,
                "timed out closing socket"
            ),
        }
    }

    /// Write one frame under the single-writer lock.
    ///
    /// Teardown abandons the write, including one stuck on a full socket,
    /// and the caller gets the closing cause.
    async fn write(&self, frame: Bytes) -> Result<(), RpcError> {
        let send = async {
            let mut writer = self.writer.lock().await;
            self.check_open()?;
            writer
                .send_frame(frame)
                .await
                .map_err(|e| RpcError::Write(e.to_string()))
        };

        let err = tokio::select! {
            cause = self.closed() => return Err(cause),
            outcome = send => match outcome {
                Ok(()) => return Ok(()),
                Err(err) => err,
            },
        };

        if self.shutdown(err.clone()) {
            return Err(err);
        }
        // Lost the race against another teardown; report its cause.
        Err(self.cause().unwrap_or(err))
    }

    fn route(&self, resp: Response) {
        match resp.into_inbound() {
            Inbound::Reply { id, outcome } => {
                let outcome = outcome.map_err(RpcError::Remote);
                if self.pending.resolve(id, outcome) {
                    tracing::debug!(id, "reply delivered");
                } else {
                    tracing::debug!(id, "discarding reply for unknown call id");
                }
            }
            Inbound::Notification { method, params } => {
                let subscribers = self.streams.fanout(&method, params);
                tracing::debug!(method = %method, subscribers, "notification");
            }
            Inbound::Unroutable => {
                tracing::debug!("discarding frame with neither id nor method");
            }
        }
    }
}

/// Dispatch loop: the only reader of the socket.
async fn dispatch<C: Codec>(
    inner: Arc<Inner<C>>,
    mut reader: Box<dyn FrameReader>,
    mut state: watch::Receiver<Option<RpcError>>,
) {
    let cause = loop {
        let frame = tokio::select! {
            // Closed from outside: nothing left to report.
            _ = state.changed() => break None,
            frame = reader.recv_frame() => frame,
        };

        match frame {
            None => {
                tracing::debug!("peer closed the connection");
                break Some(RpcError::ConnClosing);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "read failed");
                break Some(RpcError::from(e));
            }
            Some(Ok(bytes)) => match inner.codec.decode_response(&bytes) {
                Ok(resp) => inner.route(resp),
                // Framing can no longer be trusted.
                Err(e) => break Some(RpcError::from(e)),
            },
        }
    };

    if let Some(cause) = cause {
        inner.shutdown(cause);
    }
    inner.close_writer().await;
}

/// A multiplexed RPC connection.
///
/// All operations take `&self`; share it between tasks with an `Arc`.
/// Dropping the connection closes it.
pub struct Conn<C: Codec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Conn<C> {
    /// Wrap an established transport and start the dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Transport, codec: C, config: ConnConfig) -> Self {
        let (state, state_rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            codec: Arc::new(codec),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(transport.writer),
            writer_closed: AtomicBool::new(false),
            pending: PendingCalls::new(),
            streams: StreamRegistry::new(config.stream_capacity),
            state,
            config,
        });

        tokio::spawn(dispatch(Arc::clone(&inner), transport.reader, state_rx));

        Self { inner }
    }

    /// Dial `addr` with `dialer` and start the connection.
    ///
    /// An already expired `deadline` fails with
    /// [`DialError::DeadlineExceeded`] before the address is looked at.
    pub async fn dial<D>(
        dialer: &D,
        addr: &str,
        deadline: Option<Instant>,
        codec: C,
        config: ConnConfig,
    ) -> Result<Self, RpcError>
    where
        D: Dialer + ?Sized,
    {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DialError::DeadlineExceeded.into());
        }

        let dial = dialer.dial(addr);
        let transport = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, dial)
                .await
                .map_err(|_| DialError::DeadlineExceeded)?,
            None => dial.await,
        }
        .map_err(|e| DialError::Connect(e.to_string()))?;

        tracing::info!(addr, "connected");
        Ok(Self::new(transport, codec, config))
    }

    /// The codec bound to this connection.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub(crate) fn codec_handle(&self) -> Arc<C> {
        Arc::clone(&self.inner.codec)
    }

    /// Invoke `method` and wait for its reply.
    ///
    /// Returns the raw `result` bytes, [`RpcError::Remote`] if the peer
    /// reported an error, or the closing cause if the connection goes away
    /// first. Dropping the returned future deregisters the call.
    pub async fn call(&self, method: &str, params: Option<Bytes>) -> Result<Bytes, RpcError> {
        let call = self.send_call(method, params).await?;
        call.wait().await
    }

    /// [`call`](Self::call) bounded by `timeout`.
    pub async fn call_timeout(
        &self,
        method: &str,
        params: Option<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        match tokio::time::timeout(timeout, self.call(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// [`call`](Self::call) abandoned with [`RpcError::Cancelled`] as soon
    /// as `cancel` completes.
    pub async fn call_until<F>(
        &self,
        method: &str,
        params: Option<Bytes>,
        cancel: F,
    ) -> Result<Bytes, RpcError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            outcome = self.call(method, params) => outcome,
            _ = cancel => Err(RpcError::Cancelled),
        }
    }

    async fn send_call(&self, method: &str, params: Option<Bytes>) -> Result<PendingCall, RpcError> {
        self.inner.check_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let call = self.inner.pending.register(id)?;
        let frame = self.inner.codec.encode_request(&Request::call(id, method, params))?;
        self.inner.write(frame).await?;
        tracing::debug!(id, method, "call sent");
        Ok(call)
    }

    /// Send a notification. No reply is expected.
    pub async fn notify(&self, method: &str, params: Option<Bytes>) -> Result<(), RpcError> {
        self.inner.check_open()?;
        let frame = self
            .inner
            .codec
            .encode_request(&Request::notification(method, params))?;
        self.inner.write(frame).await?;
        tracing::debug!(method, "notification sent");
        Ok(())
    }

    /// Subscribe to notifications for `method`.
    pub fn subscribe(&self, method: &str) -> Result<Subscription, RpcError> {
        self.inner.check_open()?;
        let sub = self.inner.streams.add(method);
        tracing::debug!(method, "subscribed");
        Ok(sub)
    }

    /// Close the connection, releasing every waiter with
    /// [`RpcError::ConnClosing`].
    ///
    /// Only the first close succeeds; later calls return the original cause.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.close_with(RpcError::ConnClosing).await
    }

    /// Close the connection with `cause`, which every pending call, open
    /// subscription and later operation then reports.
    ///
    /// Returns `Err(original cause)` if the connection was already closed.
    /// Completes within [`ConnConfig::close_timeout`].
    pub async fn close_with(&self, cause: RpcError) -> Result<(), RpcError> {
        if !self.inner.shutdown(cause) {
            return Err(self.inner.cause().unwrap_or(RpcError::ConnClosing));
        }
        self.inner.close_writer().await;
        Ok(())
    }

    /// Tear down with `cause` without waiting; the dispatch task closes
    /// the socket.
    pub(crate) fn abort(&self, cause: RpcError) -> bool {
        self.inner.shutdown(cause)
    }

    /// Resolves with the closing cause once the connection has closed.
    pub async fn closed(&self) -> RpcError {
        self.inner.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cause().is_some()
    }

    /// The closing cause, if the connection has closed.
    pub fn closing_cause(&self) -> Option<RpcError> {
        self.inner.cause()
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of open subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.inner.streams.len()
    }
}

impl<C: Codec> Drop for Conn<C> {
    fn drop(&mut self) {
        self.inner.shutdown(RpcError::ConnClosing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CodecError, TransportError};
    use crate::transport::memory::{self, MemoryTransport};

    /// Plays the remote side over an in-memory pipe.
    struct Peer {
        end: MemoryTransport,
    }

    impl Peer {
        async fn recv_json(&mut self) -> serde_json::Value {
            let frame = self.end.reader.recv_frame().await.unwrap().unwrap();
            serde_json::from_slice(&frame).unwrap()
        }

        async fn send_raw(&mut self, frame: &str) {
            self.end
                .writer
                .send_frame(Bytes::copy_from_slice(frame.as_bytes()))
                .await
                .unwrap();
        }

        async fn send_json(&mut self, value: serde_json::Value) {
            self.send_raw(&value.to_string()).await;
        }
    }

    fn connect() -> (Arc<Conn>, Peer) {
        connect_with(ConnConfig::default())
    }

    fn connect_with(config: ConnConfig) -> (Arc<Conn>, Peer) {
        let (local, remote) = memory::pair(64);
        let conn = Conn::new(local.into_transport(), JsonCodec, config);
        (Arc::new(conn), Peer { end: remote })
    }

    fn spawn_call(conn: &Arc<Conn>, method: &'static str) -> tokio::task::JoinHandle<Result<Bytes, RpcError>> {
        let conn = Arc::clone(conn);
        tokio::spawn(async move { conn.call(method, None).await })
    }

    #[tokio::test]
    async fn ids_start_at_one_and_replies_correlate() {
        let (conn, mut peer) = connect();

        let first = spawn_call(&conn, "test.Hello");
        let req = peer.recv_json().await;
        assert_eq!(req["id"], 1);
        assert_eq!(req["method"], "test.Hello");
        peer.send_json(serde_json::json!({"id": 1, "result": "hello"})).await;
        assert_eq!(&first.await.unwrap().unwrap()[..], br#""hello""#);

        let second = spawn_call(&conn, "test.World");
        let req = peer.recv_json().await;
        assert_eq!(req["id"], 2);
        peer.send_json(serde_json::json!({"id": 2, "result": "world"})).await;
        assert_eq!(&second.await.unwrap().unwrap()[..], br#""world""#);
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_callers() {
        let (conn, mut peer) = connect();

        let mut handles = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..16 {
            handles.push(spawn_call(&conn, "test.Echo"));
            ids.push(peer.recv_json().await["id"].as_u64().unwrap());
        }
        for id in ids.iter().rev() {
            peer.send_json(serde_json::json!({"id": id, "result": id})).await;
        }

        let mut got: Vec<u64> = Vec::new();
        for handle in handles {
            let bytes = handle.await.unwrap().unwrap();
            got.push(serde_json::from_slice(&bytes).unwrap());
        }
        // Each caller received the reply to its own request id.
        assert_eq!(got, ids);
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn remote_error_is_call_local() {
        let (conn, mut peer) = connect();

        let call = spawn_call(&conn, "test.Hello");
        let id = peer.recv_json().await["id"].clone();
        peer.send_json(serde_json::json!({"id": id, "error": {"code": -32000, "message": "bad request"}}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.as_remote().unwrap().message, "bad request");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn stale_reply_is_discarded() {
        let (conn, mut peer) = connect();
        let sub = conn.subscribe("test.Notify").unwrap();

        let call = spawn_call(&conn, "test.Hello");
        let id = peer.recv_json().await["id"].as_u64().unwrap();

        peer.send_json(serde_json::json!({"id": 999, "result": "stray"})).await;
        peer.send_json(serde_json::json!({"method": "test.Notify", "params": 1})).await;
        peer.send_json(serde_json::json!({"id": id, "result": "mine"})).await;

        assert_eq!(&call.await.unwrap().unwrap()[..], br#""mine""#);
        assert_eq!(&sub.recv().await.unwrap()[..], b"1");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn notifications_fan_out_by_method() {
        let (conn, mut peer) = connect();
        let a = conn.subscribe("test.Notify").unwrap();
        let b = conn.subscribe("test.Notify").unwrap();
        let other = conn.subscribe("test.Other").unwrap();

        for n in 0..3 {
            peer.send_json(serde_json::json!({"method": "test.Notify", "params": n})).await;
        }

        for sub in [&a, &b] {
            for n in 0..3 {
                let got: u32 = serde_json::from_slice(&sub.recv().await.unwrap()).unwrap();
                assert_eq!(got, n);
            }
        }
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn decode_failure_closes_connection() {
        let (conn, mut peer) = connect();
        let sub = conn.subscribe("test.Notify").unwrap();

        let call = spawn_call(&conn, "test.Hello");
        peer.recv_json().await;
        peer.send_raw("{this is not json").await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert_eq!(sub.recv().await, Err(err.clone()));
        assert_eq!(conn.closed().await, err);
        assert_eq!(conn.call("test.Again", None).await, Err(err));
    }

    #[tokio::test]
    async fn read_failure_closes_connection() {
        let (conn, mut peer) = connect();
        let call = spawn_call(&conn, "test.Hello");
        peer.recv_json().await;

        peer.end
            .writer
            .send_error(TransportError::AbnormalClosure("reset".into()))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn peer_hangup_yields_closing_sentinel() {
        let (conn, peer) = connect();
        let call = spawn_call(&conn, "test.Hello");
        drop(peer);
        let err = call.await.unwrap().unwrap_err();
        // Depending on who notices first: the writer or the dispatch task.
        assert!(err.is_closing() || matches!(err, RpcError::Write(_)));
        assert_eq!(conn.closed().await, err);
    }

    #[tokio::test]
    async fn close_releases_everything_and_is_idempotent() {
        let (conn, mut peer) = connect();
        let sub = conn.subscribe("test.Notify").unwrap();
        let call = spawn_call(&conn, "test.Hello");
        peer.recv_json().await;

        assert_eq!(conn.close().await, Ok(()));
        assert_eq!(conn.close().await, Err(RpcError::ConnClosing));

        assert_eq!(call.await.unwrap(), Err(RpcError::ConnClosing));
        assert_eq!(sub.recv().await, Err(RpcError::ConnClosing));
        assert_eq!(conn.notify("test.Ping", None).await, Err(RpcError::ConnClosing));
        assert_eq!(conn.subscribe("test.Notify").unwrap_err(), RpcError::ConnClosing);
        assert_eq!(conn.pending_calls(), 0);

        // The socket was closed too.
        assert!(peer.end.reader.recv_frame().await.is_none());
    }

    #[tokio::test]
    async fn close_releases_a_writer_blocked_on_a_full_socket() {
        let (local, mut remote) = memory::pair(1);
        let conn = Arc::new(Conn::new(
            local.into_transport(),
            JsonCodec,
            ConnConfig {
                close_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        ));

        // The peer never reads: the first frame fills the pipe, the second
        // write blocks.
        let first = spawn_call(&conn, "test.First");
        while conn.pending_calls() < 1 {
            tokio::task::yield_now().await;
        }
        let second = spawn_call(&conn, "test.Second");
        while conn.pending_calls() < 2 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let closed = tokio::time::timeout(Duration::from_secs(1), conn.close()).await;
        assert_eq!(closed, Ok(Ok(())));

        let first = tokio::time::timeout(Duration::from_secs(1), first).await;
        assert_eq!(first.unwrap().unwrap(), Err(RpcError::ConnClosing));
        let second = tokio::time::timeout(Duration::from_secs(1), second).await;
        assert_eq!(second.unwrap().unwrap(), Err(RpcError::ConnClosing));
        assert_eq!(conn.pending_calls(), 0);

        // The socket is closed once the blocked writer lets go.
        assert!(remote.reader.recv_frame().await.unwrap().is_ok());
        let end = tokio::time::timeout(Duration::from_secs(1), remote.reader.recv_frame()).await;
        assert!(end.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_with_records_the_callers_cause() {
        let (conn, _peer) = connect();
        let sub = conn.subscribe("test.Notify").unwrap();
        let cause = RpcError::Transport("shutting down".into());

        assert_eq!(conn.close_with(cause.clone()).await, Ok(()));
        assert_eq!(conn.close().await, Err(cause.clone()));
        assert_eq!(sub.recv().await, Err(cause.clone()));
        assert_eq!(conn.closed().await, cause);
    }

    #[tokio::test]
    async fn timeout_and_cancel_deregister_the_call() {
        let (conn, mut peer) = connect();

        let err = conn
            .call_timeout("test.Slow", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout { ms: 20 });
        assert_eq!(conn.pending_calls(), 0);
        let late_id = peer.recv_json().await["id"].clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let cancelled = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.call_until("test.Slow", None, async {
                    let _ = rx.await;
                })
                .await
            })
        };
        peer.recv_json().await;
        tx.send(()).unwrap();
        assert_eq!(cancelled.await.unwrap(), Err(RpcError::Cancelled));
        assert_eq!(conn.pending_calls(), 0);

        // A late reply for the abandoned call is a harmless no-op.
        peer.send_json(serde_json::json!({"id": late_id, "result": null})).await;
        let call = spawn_call(&conn, "test.Next");
        let id = peer.recv_json().await["id"].clone();
        peer.send_json(serde_json::json!({"id": id, "result": true})).await;
        assert_eq!(&call.await.unwrap().unwrap()[..], b"true");
    }

    #[tokio::test]
    async fn notify_sends_without_id() {
        let (conn, mut peer) = connect();
        conn.notify("test.Ping", Some(Bytes::from_static(b"[1]"))).await.unwrap();
        let req = peer.recv_json().await;
        assert!(req.get("id").is_none());
        assert_eq!(req["method"], "test.Ping");
        assert_eq!(req["params"], serde_json::json!([1]));
        assert_eq!(conn.pending_calls(), 0);
    }

    struct FailingCodec;

    impl Codec for FailingCodec {
        fn encode_request(&self, _req: &Request) -> Result<Bytes, CodecError> {
            Err(CodecError::Encode("fail".into()))
        }

        fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError> {
            JsonCodec.decode_response(frame)
        }

        fn encode_payload<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
            JsonCodec.encode_payload(value)
        }

        fn decode_payload<T: serde::de::DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
            JsonCodec.decode_payload(payload)
        }
    }

    #[tokio::test]
    async fn encode_failure_is_call_local() {
        let (local, _remote) = memory::pair(4);
        let conn = Conn::new(local.into_transport(), FailingCodec, ConnConfig::default());

        assert_eq!(conn.call("test.Hello", None).await, Err(RpcError::Encode("fail".into())));
        assert_eq!(conn.pending_calls(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn write_failure_closes_connection() {
        let (local, remote) = memory::pair(4);
        let conn = Conn::new(local.into_transport(), JsonCodec, ConnConfig::default());
        drop(remote.reader);

        let err = conn.call("test.Hello", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Write(_)));
        assert_eq!(conn.closing_cause(), Some(err));
    }

    #[tokio::test]
    async fn concurrent_calls_each_get_one_outcome() {
        let (conn, mut peer) = connect();

        let server = tokio::spawn(async move {
            for _ in 0..100 {
                let req = peer.recv_json().await;
                let method = req["method"].clone();
                peer.send_json(serde_json::json!({"id": req["id"], "result": method})).await;
            }
            peer
        });

        let mut handles = Vec::new();
        for i in 0..100 {
            let conn = Arc::clone(&conn);
            handles.push(tokio::spawn(async move {
                let method = format!("test.M{i}");
                let reply = conn.call(&method, None).await.unwrap();
                let got: String = serde_json::from_slice(&reply).unwrap();
                assert_eq!(got, method);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        server.await.unwrap();
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dial_with_expired_deadline_fails_first() {
        let dialer = memory::MemoryDialer::new(memory::pair(1).0.into_transport());
        let err = Conn::dial(&dialer, "", Some(Instant::now()), JsonCodec, ConnConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, RpcError::Dial(DialError::DeadlineExceeded));
    }

    /// A dialer whose handshake never finishes.
    struct HangingDialer;

    #[async_trait::async_trait]
    impl Dialer for HangingDialer {
        async fn dial(&self, _addr: &str) -> Result<Transport, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn dial_deadline_expires_during_handshake() {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(20);
        let dial = Conn::dial(&HangingDialer, "mem", Some(deadline), JsonCodec, ConnConfig::default());

        let err = tokio::time::timeout(Duration::from_secs(1), dial)
            .await
            .expect("dial did not honour its deadline")
            .err()
            .unwrap();
        assert_eq!(err, RpcError::Dial(DialError::DeadlineExceeded));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn dial_reports_connect_failure() {
        let dialer = memory::MemoryDialer::new(memory::pair(1).0.into_transport());
        let _first = Conn::dial(&dialer, "mem", None, JsonCodec, ConnConfig::default())
            .await
            .unwrap();
        let err = Conn::dial(&dialer, "mem", None, JsonCodec, ConnConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Dial(DialError::Connect(_))));
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_replies() {
        let (conn, mut peer) = connect_with(ConnConfig {
            stream_capacity: 2,
            ..Default::default()
        });
        let sub = conn.subscribe("test.Flood").unwrap();

        let call = spawn_call(&conn, "test.Hello");
        let id = peer.recv_json().await["id"].clone();
        for n in 0..10 {
            peer.send_json(serde_json::json!({"method": "test.Flood", "params": n})).await;
        }
        peer.send_json(serde_json::json!({"id": id, "result": "ok"})).await;

        assert_eq!(&call.await.unwrap().unwrap()[..], br#""ok""#);
        assert_eq!(sub.dropped(), 8);
        assert_eq!(&sub.recv().await.unwrap()[..], b"8");
        assert_eq!(&sub.recv().await.unwrap()[..], b"9");
    }
}
