use crate::frame::RequestId;
use crate::pool::{ConnectionId, Role};
use std::sync::Arc;
use std::time::Duration;

/// A request was rejected before it was registered or sent.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("collection name must be a String")]
    WrongType,
    #[error("collection names cannot be empty")]
    EmptyName,
    #[error("collection names must not contain '$'")]
    ContainsDollar,
    #[error("collection names must not start or end with '.'")]
    BoundaryDot,
    #[error("key {0} must not start with '$'")]
    KeyStartsWithDollar(String),
    #[error("key {0} must not contain '.'")]
    KeyContainsDot(String),
}

/// Every way a submitted operation can fail.
///
/// Apart from `Validation`, each of these reaches the caller through the same single resolution path as a successful reply.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    #[error("request {request_id} timed out after {elapsed:?} without a reply")]
    Timeout {
        request_id: RequestId,
        elapsed: Duration,
    },

    #[error("connection {connection} was closed before request {request_id} was answered: {cause}")]
    ConnectionClosed {
        request_id: RequestId,
        connection: ConnectionId,
        #[source]
        cause: anyhow::Error,
    },

    /// The write was sent but its confirmation never came back.
    /// The write may or may not have been applied.
    #[error("write {write_id} was sent but its outcome is unknown")]
    IndeterminateWrite {
        write_id: RequestId,
        #[source]
        cause: Box<DriverError>,
    },

    #[error("{message}")]
    WriteRejected { message: String },

    #[error("{message}")]
    CommandFailed { message: String },

    #[error("no healthy {role} connection is available")]
    NoHealthyConnection { role: Role },

    #[error("Collection {name} does not exist. Currently in strict mode.")]
    CollectionDoesNotExist { name: String },

    #[error("Collection {name} already exists. Currently in strict mode.")]
    CollectionAlreadyExists { name: String },

    #[error("failed to decode the reply to request {request_id}")]
    Decode {
        request_id: RequestId,
        #[source]
        cause: serde_json::Error,
    },

    #[error("IO error {0}")]
    Io(Arc<anyhow::Error>),
}

impl DriverError {
    /// Whether the same request may simply be sent again.
    /// An indeterminate write is deliberately excluded: retrying it may apply it twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. }
                | DriverError::ConnectionClosed { .. }
                | DriverError::NoHealthyConnection { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, DriverError::Validation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}
