//! Body marshalling per content type.

use crate::protocol::{CodecError, ContentType};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Response or request body before marshalling.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Payload {
    /// Serialize any value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Binary(data.into())
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Json(_) => ContentType::Json,
            Payload::Binary(_) => ContentType::Binary,
        }
    }

    /// Deserialize a JSON payload into `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        match self {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            Payload::Binary(_) => Err(CodecError::UnsupportedPayload(ContentType::Binary)),
        }
    }
}

/// Converts payloads to and from body bytes for one content type.
pub trait Marshaller: Send + Sync {
    fn content_type(&self) -> ContentType;

    fn marshal(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, body: &[u8]) -> Result<Payload, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn content_type(&self) -> ContentType {
        ContentType::Json
    }

    fn marshal(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        match payload {
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
            Payload::Binary(_) => Err(CodecError::UnsupportedPayload(ContentType::Json)),
        }
    }

    fn unmarshal(&self, body: &[u8]) -> Result<Payload, CodecError> {
        Ok(Payload::Json(serde_json::from_slice(body)?))
    }
}

/// Pass-through marshaller for opaque binary messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryMarshaller;

impl Marshaller for BinaryMarshaller {
    fn content_type(&self) -> ContentType {
        ContentType::Binary
    }

    fn marshal(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        match payload {
            Payload::Binary(data) => Ok(data.to_vec()),
            Payload::Json(_) => Err(CodecError::UnsupportedPayload(ContentType::Binary)),
        }
    }

    fn unmarshal(&self, body: &[u8]) -> Result<Payload, CodecError> {
        Ok(Payload::Binary(Bytes::copy_from_slice(body)))
    }
}
