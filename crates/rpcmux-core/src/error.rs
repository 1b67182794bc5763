//! Error taxonomy for the connection engine.
//!
//! Every blocking operation on a [`Conn`](crate::Conn) resolves to one of
//! these instead of hanging. The closing cause of a connection is stored once
//! and cloned into every pending call and subscription, which is why
//! [`RpcError`] carries owned strings rather than boxed sources.

use thiserror::Error;

use crate::request::RemoteError;

/// Errors surfaced by the connection engine and its façade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The dial step failed before a connection existed.
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// A request or payload could not be encoded. Local to one call.
    #[error("encoding request: {0}")]
    Encode(String),

    /// Writing a frame to the socket failed. Closes the connection.
    #[error("write failed: {0}")]
    Write(String),

    /// An inbound frame or reply payload could not be decoded. Closes the connection.
    #[error("decoding response: {0}")]
    Decode(String),

    /// Structured error returned by the remote side for one call.
    #[error("{0}")]
    Remote(RemoteError),

    /// The connection is closing or already closed.
    #[error("the connection is closing")]
    ConnClosing,

    /// The subscription was closed by its owner.
    #[error("stream closed")]
    StreamClosed,

    /// The caller's cancellation signal fired before a reply arrived.
    #[error("call cancelled")]
    Cancelled,

    /// The caller's deadline passed before a reply arrived.
    #[error("call timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The underlying transport failed to read (abnormal closure, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Returns `true` for the closing sentinel.
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::ConnClosing)
    }

    /// Returns `true` if this error, raised inside the engine, tears down
    /// the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Decode(_) | Self::Transport(_))
    }

    /// Returns the remote error payload, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from establishing a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    /// The deadline expired before (or while) the handshake completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The lower-level connect or handshake was rejected.
    #[error("connect: {0}")]
    Connect(String),
}

/// Errors from a [`Codec`](crate::codec::Codec).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),

    #[error("decode: {0}")]
    Decode(String),
}

/// Errors from a frame transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away without a closing handshake.
    #[error("abnormal closure: {0}")]
    AbnormalClosure(String),

    /// The transport has been closed locally.
    #[error("transport closed")]
    Closed,

    /// Any other I/O or protocol failure.
    #[error("{0}")]
    Io(String),
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Encode(msg) => Self::Encode(msg),
            CodecError::Decode(msg) => Self::Decode(msg),
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}
