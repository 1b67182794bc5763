//! Connection configuration.

use std::time::Duration;

/// Configuration for a [`Conn`](crate::Conn).
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Payloads buffered per subscription before the oldest is dropped.
    pub stream_capacity: usize,
    /// Upper bound on closing the socket during teardown.
    pub close_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1024,
            close_timeout: Duration::from_secs(5),
        }
    }
}
