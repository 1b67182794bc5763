//! Typed convenience layer over [`Conn`].
//!
//! `invoke` encodes params with the connection's codec, waits for the reply
//! and decodes it. `subscribe` wraps a raw [`Subscription`] so that every
//! notification comes out as a decoded `T`.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::conn::Conn;
use crate::error::RpcError;
use crate::streams::Subscription;

/// Call `method` with `params` and decode the reply into `R`.
///
/// A reply that does not decode into `R` is treated like a corrupt frame:
/// the connection is closed with the resulting [`RpcError::Decode`].
pub async fn invoke<C, P, R>(conn: &Conn<C>, method: &str, params: &P) -> Result<R, RpcError>
where
    C: Codec,
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let params = conn.codec().encode_payload(params)?;
    let result = conn.call(method, Some(params)).await?;
    decode_reply(conn, method, &result)
}

/// [`invoke`] bounded by `timeout`.
pub async fn invoke_timeout<C, P, R>(
    conn: &Conn<C>,
    method: &str,
    params: &P,
    timeout: Duration,
) -> Result<R, RpcError>
where
    C: Codec,
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let params = conn.codec().encode_payload(params)?;
    let result = conn.call_timeout(method, Some(params), timeout).await?;
    decode_reply(conn, method, &result)
}

fn decode_reply<C: Codec, R: DeserializeOwned>(
    conn: &Conn<C>,
    method: &str,
    result: &[u8],
) -> Result<R, RpcError> {
    conn.codec().decode_payload(result).map_err(|e| {
        let err = RpcError::from(e);
        tracing::warn!(method, error = %err, "undecodable reply, closing connection");
        conn.abort(err.clone());
        err
    })
}

/// Send a typed notification.
pub async fn send_notification<C, P>(conn: &Conn<C>, method: &str, params: &P) -> Result<(), RpcError>
where
    C: Codec,
    P: Serialize + ?Sized,
{
    let params = conn.codec().encode_payload(params)?;
    conn.notify(method, Some(params)).await
}

/// Subscribe to `method`, decoding each notification into `T`.
pub fn subscribe<C, T>(conn: &Conn<C>, method: &str) -> Result<Notifications<T, C>, RpcError>
where
    C: Codec,
    T: DeserializeOwned,
{
    Ok(Notifications {
        sub: conn.subscribe(method)?,
        codec: conn.codec_handle(),
        _marker: PhantomData,
    })
}

/// A subscription that yields decoded notifications.
pub struct Notifications<T, C> {
    sub: Subscription,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, C: Codec> Notifications<T, C> {
    /// Wait for the next notification and decode it.
    ///
    /// A payload that does not decode only fails this receive; the
    /// subscription stays open.
    pub async fn recv(&self) -> Result<T, RpcError> {
        let payload = self.sub.recv().await?;
        Ok(self.codec.decode_payload(&payload)?)
    }

    /// The underlying raw subscription.
    pub fn raw(&self) -> &Subscription {
        &self.sub
    }

    pub fn close(&self) {
        self.sub.close();
    }

    /// Turn into a lazy stream of decoded notifications.
    ///
    /// Decode failures are yielded as items. The stream ends after the
    /// subscription closes; a closing cause other than
    /// [`RpcError::StreamClosed`] is yielded once as the final item.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, RpcError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let this = state?;
            match this.sub.recv().await {
                Ok(payload) => {
                    let item = this.codec.decode_payload(&payload).map_err(RpcError::from);
                    Some((item, Some(this)))
                }
                Err(RpcError::StreamClosed) => None,
                Err(cause) => Some((Err(cause), None)),
            }
        })
    }
}
