//! The pluggable codec capability and the default JSON codec.
//!
//! A codec turns envelopes into frame bytes and back. The engine never looks
//! inside `params`/`result`; it only needs the codec to hand them over as raw
//! byte slices so the caller can decode them into domain types later.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::CodecError;
use crate::request::{RemoteError, Request, Response};

/// Envelope serialization for one connection.
///
/// The envelope methods are object-safe; the payload helpers are only
/// available on concrete codecs and back the typed façade.
pub trait Codec: Send + Sync + 'static {
    /// Serialize one request envelope into one frame.
    fn encode_request(&self, req: &Request) -> Result<Bytes, CodecError>;

    /// Deserialize one frame into the generic response envelope.
    fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError>;

    /// Serialize a domain value into the raw bytes carried in `params`.
    fn encode_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>
    where
        Self: Sized;

    /// Decode raw `params`/`result` bytes into a domain value.
    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>
    where
        Self: Sized;
}

/// JSON codec backed by `serde_json`. Payloads pass through as raw JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct WireResponse<'a> {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(borrow, default)]
    params: Option<&'a RawValue>,
    #[serde(borrow, default)]
    result: Option<&'a RawValue>,
    #[serde(borrow, default)]
    error: Option<WireError<'a>>,
}

#[derive(Deserialize)]
struct WireError<'a> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
}

fn raw_bytes(raw: Option<&RawValue>) -> Option<Bytes> {
    raw.map(|r| Bytes::copy_from_slice(r.get().as_bytes()))
}

impl Codec for JsonCodec {
    fn encode_request(&self, req: &Request) -> Result<Bytes, CodecError> {
        let params = match &req.params {
            Some(p) => Some(
                serde_json::from_slice::<&RawValue>(p)
                    .map_err(|e| CodecError::Encode(format!("params are not valid JSON: {e}")))?,
            ),
            None => None,
        };
        let wire = WireRequest {
            id: req.id,
            method: &req.method,
            params,
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError> {
        let wire: WireResponse<'_> =
            serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Response {
            id: wire.id,
            method: wire.method,
            params: raw_bytes(wire.params),
            result: raw_bytes(wire.result),
            error: wire.error.map(|e| RemoteError {
                code: e.code,
                message: e.message,
                data: raw_bytes(e.data),
            }),
        })
    }

    fn encode_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        // An absent payload reads as `null`, so `()` and `Option<_>` replies work.
        let payload = if payload.is_empty() { b"null".as_slice() } else { payload };
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
