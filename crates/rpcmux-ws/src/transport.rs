//! Frame transport over a `tokio-tungstenite` WebSocket stream.
//!
//! One WebSocket message is one frame. UTF-8 frames go out as text
//! messages, anything else as binary. Control messages are handled by
//! tungstenite and never surface as frames.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError, Message};
use tokio_tungstenite::WebSocketStream;

use rpcmux_core::{FrameReader, FrameWriter, Transport, TransportError};

/// Write half of a WebSocket transport.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

/// Read half of a WebSocket transport.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into an engine transport.
pub fn from_stream<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Transport::new(WsWriter { sink }, WsReader { stream })
}

fn map_err(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::AbnormalClosure("connection reset without closing handshake".into())
        }
        tungstenite::Error::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::AbnormalClosure(io.to_string())
        }
        other => TransportError::Io(other.to_string()),
    }
}

fn close_outcome(frame: Option<CloseFrame<'_>>) -> Option<Result<Bytes, TransportError>> {
    match frame {
        None => None,
        Some(cf) if matches!(cf.code, CloseCode::Normal | CloseCode::Away) => None,
        Some(cf) => Some(Err(TransportError::AbnormalClosure(format!(
            "close code {}: {}",
            u16::from(cf.code),
            cf.reason
        )))),
    }
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let msg = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink.send(msg).await.map_err(map_err)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(map_err)
    }
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Bytes::from(text))),
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "received close frame");
                    return close_outcome(frame);
                }
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(map_err(e))),
            }
        }
    }
}
