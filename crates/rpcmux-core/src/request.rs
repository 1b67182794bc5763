//! Message envelopes.
//!
//! Envelopes are format-agnostic: `params` and `result` are carried as the
//! raw bytes the codec produced, and are only decoded into domain types by
//! the caller after delivery.

use bytes::Bytes;

/// An outbound envelope. `id == None` marks a notification sent by this side.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<u64>,
    pub method: String,
    pub params: Option<Bytes>,
}

impl Request {
    /// A request expecting exactly one reply correlated by `id`.
    pub fn call(id: u64, method: impl Into<String>, params: Option<Bytes>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// A fire-and-forget request.
    pub fn notification(method: impl Into<String>, params: Option<Bytes>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Structured error reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    /// Raw encoded `data` member, if any.
    pub data: Option<Bytes>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({})", String::from_utf8_lossy(data))?;
        }
        Ok(())
    }
}

/// An inbound envelope, decoded once per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Bytes>,
    pub result: Option<Bytes>,
    pub error: Option<RemoteError>,
}

/// What the dispatch loop should do with a decoded [`Response`].
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Reply to a prior call.
    Reply {
        id: u64,
        outcome: Result<Bytes, RemoteError>,
    },
    /// Server-pushed notification.
    Notification { method: String, params: Bytes },
    /// Neither an id nor a method; nothing to route.
    Unroutable,
}

impl Response {
    /// Classify the envelope. An id without a method is a reply; anything
    /// carrying a method is a notification.
    pub fn into_inbound(self) -> Inbound {
        match (self.id, self.method) {
            (Some(id), None) => {
                let outcome = match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or_default()),
                };
                Inbound::Reply { id, outcome }
            }
            (_, Some(method)) => Inbound::Notification {
                method,
                params: self.params.unwrap_or_default(),
            },
            (None, None) => Inbound::Unroutable,
        }
    }
}
