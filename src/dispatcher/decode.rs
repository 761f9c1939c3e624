//! Request body decoding.
//!
//! A [`BodyType`] describes what a handler expects its body to be: a Rust type
//! to deserialize into, optionally guarded by a JSON Schema. A [`BodyDecoder`]
//! turns raw bytes into that type or into a [`ValidationError`] listing the
//! offending fields.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A resolved argument value, shared between the dependency cache and handlers
pub type Arg = Arc<dyn Any + Send + Sync>;

type Convert = fn(Value) -> Result<Arg, serde_json::Error>;

fn convert<T: DeserializeOwned + Send + Sync + 'static>(value: Value) -> Result<Arg, serde_json::Error> {
    serde_json::from_value::<T>(value).map(|v| Arc::new(v) as Arg)
}

/// Target type of a request body
#[derive(Clone)]
pub struct BodyType {
    name: &'static str,
    convert: Convert,
    schema: Option<Arc<jsonschema::Validator>>,
}

impl fmt::Debug for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyType")
            .field("name", &self.name)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

impl BodyType {
    /// Deserialize the body into `T`
    #[must_use]
    pub fn of<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            convert: convert::<T>,
            schema: None,
        }
    }

    /// Accept any JSON document and hand it over as a [`serde_json::Value`]
    #[must_use]
    pub fn json() -> Self {
        Self::of::<Value>()
    }

    /// Validate the body against a JSON Schema before deserializing it
    ///
    /// # Errors
    ///
    /// Returns the schema compiler's message when `schema` is not a valid schema.
    pub fn with_schema(mut self, schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        self.schema = Some(Arc::new(validator));
        Ok(self)
    }

    /// Name of the target type, for logs and route listings
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// One problem found in a request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Field the problem concerns, or `body` when it concerns the whole document
    pub field: String,
    /// Human-readable description
    pub message: String,
}

impl FieldError {
    /// Create a field error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The body could not be decoded into the declared type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Every problem found, at least one
    pub fields: Vec<FieldError>,
}

impl ValidationError {
    /// A validation error about the body as a whole
    pub fn body(message: impl Into<String>) -> Self {
        Self {
            fields: vec![FieldError::new("body", message)],
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request body failed validation")?;
        for field in &self.fields {
            write!(f, "; {}: {}", field.field, field.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Turns raw request bytes into a typed argument
pub trait BodyDecoder: Send + Sync {
    /// Decode `bytes` into `target`
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming each offending field.
    fn decode(&self, bytes: &[u8], target: &BodyType) -> Result<Arg, ValidationError>;
}

/// Default decoder: `serde_json` plus the optional JSON Schema check
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBodyDecoder;

impl BodyDecoder for JsonBodyDecoder {
    fn decode(&self, bytes: &[u8], target: &BodyType) -> Result<Arg, ValidationError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::body("Request body required"));
        }
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidationError::body(format!("Invalid JSON: {e}")))?;

        if let Some(schema) = &target.schema {
            let fields: Vec<FieldError> = schema
                .iter_errors(&value)
                .map(|e| schema_field_error(&e.to_string()))
                .collect();
            if !fields.is_empty() {
                return Err(ValidationError { fields });
            }
        }

        (target.convert)(value).map_err(|e| {
            let message = e.to_string();
            let field = backticked(&message).unwrap_or("body").to_string();
            ValidationError {
                fields: vec![FieldError { field, message }],
            }
        })
    }
}

/// serde reports field names in backticks: "missing field `price`"
fn backticked(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

/// Schema errors name the property in quotes: `"price" is a required property`
fn schema_field_error(message: &str) -> FieldError {
    let field = message
        .strip_suffix(" is a required property")
        .map(|quoted| quoted.trim_matches('"'))
        .unwrap_or("body");
    FieldError::new(field, message)
}
