//! Frame transport traits and the pluggable dial step.
//!
//! A transport moves whole frames (one encoded envelope each). The engine
//! splits it into a writer, shared by callers behind the single-writer lock,
//! and a reader owned by the dispatch task.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Write half of a frame transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write exactly one frame.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the underlying socket.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a frame transport.
///
/// `recv_frame` must be cancel-safe: the dispatch task races it against the
/// shutdown signal and drops the future when the connection closes.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next frame, `Some(Err(_))` on failure, `None` once the peer closed cleanly.
    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// An established duplex transport, already split.
pub struct Transport {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

impl Transport {
    pub fn new(writer: impl FrameWriter, reader: impl FrameReader) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
        }
    }
}

/// The externally supplied dial primitive.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a transport to `addr`. Deadlines are applied by the caller.
    async fn dial(&self, addr: &str) -> Result<Transport, TransportError>;
}

/// In-process transport over Tokio channels.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    type Item = Result<Bytes, TransportError>;

    /// Write half of an in-memory transport.
    pub struct MemoryWriter {
        tx: Option<mpsc::Sender<Item>>,
    }

    /// Read half of an in-memory transport.
    pub struct MemoryReader {
        rx: mpsc::Receiver<Item>,
    }

    /// One end of an in-memory duplex pipe.
    pub struct MemoryTransport {
        pub writer: MemoryWriter,
        pub reader: MemoryReader,
    }

    impl MemoryTransport {
        pub fn into_transport(self) -> Transport {
            Transport::new(self.writer, self.reader)
        }
    }

    /// Create two connected ends, each buffering up to `capacity` frames.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MemoryTransport {
                writer: MemoryWriter { tx: Some(a_tx) },
                reader: MemoryReader { rx: b_rx },
            },
            MemoryTransport {
                writer: MemoryWriter { tx: Some(b_tx) },
                reader: MemoryReader { rx: a_rx },
            },
        )
    }

    impl MemoryWriter {
        /// Deliver a transport failure to the peer's reader, as if the socket
        /// had broken mid-stream.
        pub async fn send_error(&mut self, err: TransportError) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(Err(err)).await.map_err(|_| TransportError::Closed)
        }
    }

    #[async_trait]
    impl FrameWriter for MemoryWriter {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(Ok(frame)).await.map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.tx = None;
            Ok(())
        }
    }

    #[async_trait]
    impl FrameReader for MemoryReader {
        async fn recv_frame(&mut self) -> Option<Item> {
            self.rx.recv().await
        }
    }

    /// A [`Dialer`] that hands out a pre-built transport once.
    pub struct MemoryDialer {
        slot: std::sync::Mutex<Option<Transport>>,
    }

    impl MemoryDialer {
        pub fn new(transport: Transport) -> Self {
            Self {
                slot: std::sync::Mutex::new(Some(transport)),
            }
        }
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(&self, addr: &str) -> Result<Transport, TransportError> {
            self.slot
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Io(format!("nothing listening at {addr:?}")))
        }
    }

}
