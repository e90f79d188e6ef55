use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ServiceError;
use crate::record::Message;

/// How the raw bytes of a key or value are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeBinding {
    /// Bytes are passed through untouched.
    Raw,
    /// UTF-8 text.
    Text,
    /// A JSON document.
    Json,
}

impl fmt::Display for TypeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeBinding::Raw => "raw",
            TypeBinding::Text => "text",
            TypeBinding::Json => "json",
        };
        f.write_str(s)
    }
}

/// A decoded key or value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The record carried no bytes for this field.
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// Application-level event: what a stream processor pulls from its consumer.
///
/// `message` is the raw record the event was decoded from; it is `None` for
/// events synthesized locally with `put`.
#[derive(Debug, Clone)]
pub struct Event {
    pub key: Payload,
    pub value: Payload,
    pub message: Option<Arc<Message>>,
}

impl Event {
    pub fn new(key: Payload, value: Payload, message: Arc<Message>) -> Self {
        Self {
            key,
            value,
            message: Some(message),
        }
    }

    /// An event that did not come from the transport.
    pub fn local(key: Payload, value: Payload) -> Self {
        Self {
            key,
            value,
            message: None,
        }
    }
}

/// Per-record context handed to value decoding: which app, which key, which record.
#[derive(Debug, Clone)]
pub struct Request {
    pub app_id: Arc<str>,
    pub key: Payload,
    pub message: Arc<Message>,
}

/// Turns raw record bytes into payloads.
///
/// A `None` type binding means the descriptor did not declare one; the raw
/// bytes should be passed through.
pub trait Serializer: Send + Sync {
    fn loads_key<'a>(
        &'a self,
        key_type: Option<TypeBinding>,
        raw: Option<&'a [u8]>,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>>;

    fn loads_value<'a>(
        &'a self,
        value_type: Option<TypeBinding>,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>>;
}
