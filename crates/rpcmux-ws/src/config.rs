//! Dial configuration for the WebSocket transport.

use std::time::Duration;

use rpcmux_core::ConnConfig;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Configuration for [`dial_with`](crate::dial_with).
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Engine settings for the resulting connection.
    pub conn: ConnConfig,
    /// Deadline for the TCP + WebSocket handshake. `None` waits forever.
    pub dial_timeout: Option<Duration>,
    /// Largest inbound message accepted; `None` keeps the tungstenite default.
    pub max_message_size: Option<usize>,
    /// Bytes buffered before a write is flushed; `None` keeps the default.
    pub write_buffer_size: Option<usize>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::default(),
            dial_timeout: Some(Duration::from_secs(30)),
            max_message_size: None,
            write_buffer_size: None,
        }
    }
}

impl WsConfig {
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if let Some(size) = self.max_message_size {
            config.max_message_size = Some(size);
        }
        if let Some(size) = self.write_buffer_size {
            config.write_buffer_size = size;
        }
        config
    }
}
