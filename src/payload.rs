//! The opaque, type-erased payload carried across every socket pattern.
//!
//! The bus never inspects payload contents beyond the envelope keys it
//! itself adds (`topic`, `data`, `ts`). Callers serialize their own types
//! into a [`Payload`] via [`Payload::from_serializable`] and read them back
//! with [`Payload::into_typed`]; the bus only ever moves the opaque value
//! around.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A decoded, type-erased wire value.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(pub Value);

impl Payload {
    /// Wrap an already-constructed JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serialize `obj` into a payload.
    pub fn from_serializable<T: Serialize>(obj: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_value(obj)?))
    }

    /// Deserialize the payload into a caller-chosen type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0)
    }

    /// Borrow the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume the payload, returning the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
