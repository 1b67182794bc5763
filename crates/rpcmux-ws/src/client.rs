//! WebSocket dialer and `dial` entry points.

use async_trait::async_trait;
use tokio::time::Instant;

use rpcmux_core::{Codec, Conn, Dialer, JsonCodec, RpcError, Transport, TransportError};

use crate::config::WsConfig;
use crate::transport::from_stream;

/// [`Dialer`] that performs a WebSocket client handshake.
#[derive(Debug, Clone, Default)]
pub struct WsDialer {
    config: WsConfig,
}

impl WsDialer {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, addr: &str) -> Result<Transport, TransportError> {
        tracing::info!(url = %addr, "connecting via WebSocket");
        let (ws, _resp) = tokio_tungstenite::connect_async_with_config(
            addr,
            Some(self.config.websocket_config()),
            false,
        )
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(from_stream(ws))
    }
}

/// Dial `url` with default settings and the JSON codec.
pub async fn dial(url: &str) -> Result<Conn, RpcError> {
    dial_with(url, WsConfig::default()).await
}

/// Dial `url`, bounding the handshake by `config.dial_timeout`.
pub async fn dial_with(url: &str, config: WsConfig) -> Result<Conn, RpcError> {
    let deadline = config.dial_timeout.map(|t| Instant::now() + t);
    dial_until(url, deadline, config).await
}

/// Dial `url`, giving up at `deadline`.
///
/// An already expired deadline fails with
/// [`DialError::DeadlineExceeded`](rpcmux_core::DialError::DeadlineExceeded)
/// even when `url` is invalid.
pub async fn dial_until(
    url: &str,
    deadline: Option<Instant>,
    config: WsConfig,
) -> Result<Conn, RpcError> {
    dial_with_codec(url, deadline, JsonCodec, config).await
}

/// Dial `url` with a custom codec.
pub async fn dial_with_codec<C: Codec>(
    url: &str,
    deadline: Option<Instant>,
    codec: C,
    config: WsConfig,
) -> Result<Conn<C>, RpcError> {
    let conn_config = config.conn.clone();
    let dialer = WsDialer::new(config);
    Conn::dial(&dialer, url, deadline, codec, conn_config).await
}
