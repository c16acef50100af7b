//! Classification of completed responses.

use serde::de::DeserializeOwned;
use serde_json::Value;

use vaultlink_types::ResponseKind;

use crate::error::{Error, Result};

/// A parsed device response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A JSON document.
    Structured(Value),
    /// Trimmed text, verbatim.
    Text(String),
}

impl Response {
    /// Parse completed response text according to the expected kind.
    ///
    /// Raw-text parsing cannot fail. A structured parse failure keeps the
    /// raw text in [`Error::MalformedResponse`].
    pub fn parse(text: &str, kind: ResponseKind) -> Result<Self> {
        let text = text.trim();
        match kind {
            ResponseKind::RawText => Ok(Response::Text(text.to_string())),
            ResponseKind::Structured => serde_json::from_str(text)
                .map(Response::Structured)
                .map_err(|source| Error::MalformedResponse {
                    raw: text.to_string(),
                    source,
                }),
        }
    }

    /// The kind this response was parsed as.
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Structured(_) => ResponseKind::Structured,
            Response::Text(_) => ResponseKind::RawText,
        }
    }

    /// The JSON value, if structured.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Response::Structured(value) => Some(value),
            Response::Text(_) => None,
        }
    }

    /// The text, if raw.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(text) => Some(text),
            Response::Structured(_) => None,
        }
    }

    /// Convert into a JSON value. Raw text becomes a JSON string.
    pub fn into_json(self) -> Value {
        match self {
            Response::Structured(value) => value,
            Response::Text(text) => Value::String(text),
        }
    }

    /// Convert into text. Structured values are re-serialized.
    pub fn into_text(self) -> String {
        match self {
            Response::Text(text) => text,
            Response::Structured(value) => value.to_string(),
        }
    }

    /// Deserialize a structured response into `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_json())?)
    }

    /// Whether a structured response reports a device-side error.
    ///
    /// Either an `"error"` key or `"status": "error"` counts.
    pub fn is_device_error(&self) -> bool {
        let Some(Value::Object(map)) = self.as_json() else {
            return false;
        };
        map.contains_key("error") || map.get("status").and_then(Value::as_str) == Some("error")
    }
}
