//! Builders for the strict JSON Schemas sent with each request.
//!
//! Strict structured output requires every property to be listed in
//! `required` and `additionalProperties: false` on every object. Enum
//! values are taken from the serde labels of the Rust enums, so a schema
//! can never offer a label the decoder would reject.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::intel::label;

pub fn object(properties: Vec<(&str, Value)>) -> Value {
    let required: Vec<&str> = properties.iter().map(|(name, _)| *name).collect();
    let props: Map<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    json!({
        "type": "object",
        "properties": props,
        "required": required,
        "additionalProperties": false,
    })
}

pub fn string() -> Value {
    json!({ "type": "string" })
}

pub fn boolean() -> Value {
    json!({ "type": "boolean" })
}

/// Integer score; the 0-100 bound is checked after decoding.
pub fn score() -> Value {
    json!({ "type": "integer", "description": "0-100" })
}

pub fn string_list() -> Value {
    array(string())
}

pub fn array(items: Value) -> Value {
    json!({ "type": "array", "items": items })
}

/// String enum of the serde labels of `variants`.
pub fn one_of<T: Serialize>(variants: &[T]) -> Value {
    let labels: Vec<String> = variants.iter().map(label).collect();
    json!({ "type": "string", "enum": labels })
}
