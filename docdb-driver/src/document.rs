//! The document model shared by operations, replies and the validator.
//!
//! Documents travel as JSON objects. The byte layout of a reply body is a JSON array of documents.

use bytes::Bytes;
use serde_json::Value;

pub type Document = serde_json::Map<String, Value>;

/// Returns the object inside `value`, or `None` if `value` is not an object.
pub fn from_value(value: Value) -> Option<Document> {
    match value {
        Value::Object(document) => Some(document),
        _ => None,
    }
}

pub fn encode_documents(documents: &[Document]) -> Bytes {
    // Serializing a map of json values cannot fail
    Bytes::from(serde_json::to_vec(documents).unwrap_or_default())
}

pub fn decode_documents(body: &[u8]) -> Result<Vec<Document>, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Reads a numeric field the way servers report counts and flags: integers, floats and booleans are all accepted.
pub fn get_number(document: &Document, key: &str) -> Option<f64> {
    match document.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Returns the field as a string if it is present, a string, and not empty.
pub fn get_message<'a>(document: &'a Document, key: &str) -> Option<&'a str> {
    document
        .get(key)
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
}
