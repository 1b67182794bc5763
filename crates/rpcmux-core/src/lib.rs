//! rpcmux-core — connection engine for multiplexed JSON-RPC-style transports.
//!
//! # Overview
//!
//! One duplex frame transport carries many concurrent calls and
//! notification streams. The core crate defines:
//!
//! - [`Conn`] — the connection engine: id allocation, single-writer
//!   discipline, dispatch task, teardown
//! - [`Codec`] / [`JsonCodec`] — pluggable envelope serialization
//! - [`Request`] / [`Response`] — envelopes with raw payload bytes
//! - [`PendingCalls`] / [`StreamRegistry`] — the two routing tables
//! - [`transport`] module — frame transport and dial traits, in-memory pipe
//! - [`invoke`] module — typed `invoke` / `subscribe` helpers
//! - [`RpcError`] — error taxonomy, with [`RpcError::ConnClosing`] as the
//!   closing sentinel

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod invoke;
pub mod pending;
pub mod request;
pub mod streams;
pub mod transport;

pub use codec::{Codec, JsonCodec};
pub use config::ConnConfig;
pub use conn::Conn;
pub use error::{CodecError, DialError, RpcError, TransportError};
pub use invoke::{invoke, invoke_timeout, send_notification, subscribe, Notifications};
pub use pending::{PendingCall, PendingCalls};
pub use request::{RemoteError, Request, Response};
pub use streams::{StreamRegistry, Subscription};
pub use transport::{Dialer, FrameReader, FrameWriter, Transport};
