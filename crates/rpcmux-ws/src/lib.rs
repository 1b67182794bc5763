//! rpcmux-ws — WebSocket transport for rpcmux.
//!
//! # Features
//! - `dial` / `dial_with` / `dial_until` returning a ready [`Conn`](rpcmux_core::Conn)
//! - Text frames for UTF-8 payloads, binary otherwise
//! - Abnormal closures surface as transport errors and close the connection
//! - [`from_stream`] for WebSockets established elsewhere (custom TLS, proxies)

pub mod client;
pub mod config;
pub mod transport;

pub use client::{dial, dial_until, dial_with, dial_with_codec, WsDialer};
pub use config::WsConfig;
pub use transport::{from_stream, WsReader, WsWriter};
