use std::future::Future;
use std::pin::Pin;

use relay_api::error::ServiceError;
use relay_api::format::{Payload, Request, Serializer, TypeBinding};

/// Serializer for the `raw`, `text` and `json` type bindings.
///
/// Missing bytes decode to `Payload::Empty` for every binding.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }

    fn decode(ty: Option<TypeBinding>, raw: Option<&[u8]>) -> Result<Payload, ServiceError> {
        let Some(bytes) = raw else {
            return Ok(Payload::Empty);
        };
        match ty.unwrap_or(TypeBinding::Raw) {
            TypeBinding::Raw => Ok(Payload::Bytes(bytes.to_vec())),
            TypeBinding::Text => Ok(Payload::Text(std::str::from_utf8(bytes)?.to_owned())),
            TypeBinding::Json => Ok(Payload::Json(serde_json::from_slice(bytes)?)),
        }
    }
}

impl Serializer for JsonSerializer {
    fn loads_key<'a>(
        &'a self,
        key_type: Option<TypeBinding>,
        raw: Option<&'a [u8]>,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            Self::decode(key_type, raw).map_err(|e| e.with_context("key"))
        })
    }

    fn loads_value<'a>(
        &'a self,
        value_type: Option<TypeBinding>,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            Self::decode(value_type, request.message.value.as_deref())
                .map_err(|e| e.with_context("value"))
        })
    }
}
