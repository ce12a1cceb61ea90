//! Normalization for semi-structured JSON fields.
//!
//! Enrichment lists and stored documents reach us either as JSON text (a
//! SQLite TEXT column, a CSV-derived field) or as an already-parsed value.
//! Everything passes through [`parse_or_pass`] at ingestion so the rest of
//! the crate only ever sees typed values.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// If `value` is a string holding JSON, parse it; otherwise return it as is.
///
/// Empty and whitespace-only strings become `Value::Null`. A string that is
/// not valid JSON is kept as a plain string value.
pub fn parse_or_pass(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Null;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(s),
            }
        }
        other => other,
    }
}

/// Decode a value that may be stringified JSON into `T`.
///
/// `Null` decodes to `T::default()`.
pub fn decode<T: DeserializeOwned + Default>(value: Value) -> Result<T, serde_json::Error> {
    match parse_or_pass(value) {
        Value::Null => Ok(T::default()),
        v => serde_json::from_value(v),
    }
}

/// Decode optional JSON text, as stored in a nullable TEXT column.
pub fn decode_text<T: DeserializeOwned>(text: Option<&str>) -> Result<Option<T>, serde_json::Error> {
    match text.map(str::trim) {
        None | Some("") | Some("null") => Ok(None),
        Some(s) => serde_json::from_str(s).map(Some),
    }
}

/// `deserialize_with` helper accepting either a JSON document or its
/// string encoding.
pub fn deserialize_loose<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw = Value::deserialize(deserializer)?;
    decode(raw).map_err(serde::de::Error::custom)
}
