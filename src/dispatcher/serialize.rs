use serde_json::Value;
use std::fmt;

/// Serialized response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Serialized {
    /// Encoded body
    pub bytes: Vec<u8>,
    /// Value for the `content-type` header
    pub content_type: String,
}

/// The serializer could not encode a handler's return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError(pub String);

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to serialize response: {}", self.0)
    }
}

impl std::error::Error for SerializationError {}

/// Encodes handler return values into response bodies
pub trait Serializer: Send + Sync {
    /// Encode `value`
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError`] when the value cannot be encoded; the
    /// request is then answered with a 500.
    fn serialize(&self, value: &Value) -> Result<Serialized, SerializationError>;
}

/// Default serializer producing `application/json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Serialized, SerializationError> {
        let bytes = serde_json::to_vec(value).map_err(|e| SerializationError(e.to_string()))?;
        Ok(Serialized {
            bytes,
            content_type: "application/json".to_string(),
        })
    }
}
