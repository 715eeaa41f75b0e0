//! Frames exchanged with the server and the payloads they resolve into.

use crate::document::{self, Document};
use crate::operation::Operation;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Identifies one logical request on the wire.
/// A reply names the request it answers via [`IncomingFrame::response_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out request ids from a wrapping sequence that stays within the positive `i32` range.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        RequestIdGenerator {
            next: AtomicI32::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        loop {
            // fetch_add wraps on overflow, masking keeps us out of the negative range
            let id = self.next.fetch_add(1, Ordering::Relaxed) & i32::MAX;
            if id != 0 {
                return RequestId(id);
            }
        }
    }
}

/// Tells the resolver how to interpret the body of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Deliver the reply body untouched.
    Raw,
    /// Decode the reply body into a list of documents.
    Documents,
}

/// The value delivered to whoever is waiting on a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Documents(Vec<Document>),
}

impl Payload {
    pub fn decode(shape: ResultShape, body: Bytes) -> Result<Payload, serde_json::Error> {
        match shape {
            ResultShape::Raw => Ok(Payload::Raw(body)),
            ResultShape::Documents => document::decode_documents(&body).map(Payload::Documents),
        }
    }

    pub fn documents(&self) -> Option<&[Document]> {
        match self {
            Payload::Documents(documents) => Some(documents),
            Payload::Raw(_) => None,
        }
    }

    pub fn first_document(&self) -> Option<&Document> {
        self.documents().and_then(|documents| documents.first())
    }

    pub fn into_documents(self) -> Option<Vec<Document>> {
        match self {
            Payload::Documents(documents) => Some(documents),
            Payload::Raw(_) => None,
        }
    }
}

/// A request as handed to the codec for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingFrame {
    pub request_id: RequestId,
    pub operation: Operation,
}

/// A reply as produced by the codec.
/// The body is opaque until the pending request it answers says how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingFrame {
    pub response_to: RequestId,
    pub body: Bytes,
}

impl IncomingFrame {
    pub fn with_documents(response_to: RequestId, documents: &[Document]) -> Self {
        IncomingFrame {
            response_to,
            body: document::encode_documents(documents),
        }
    }
}
