//! Acknowledged writes.
//!
//! A write produces no reply of its own. To learn its outcome a confirmation command is queued directly
//! behind it on the same connection, the server answers the confirmation with the result of the write
//! that preceded it.

use crate::document::{self, Document};
use crate::error::DriverError;
use crate::frame::{OutgoingFrame, Payload, RequestId, ResultShape};
use crate::operation::Operation;
use crate::pool::{Connection, ConnectionId};
use crate::reaper::Reaper;
use crate::store::{PendingRequestStore, Response};
use anyhow::anyhow;
use tokio::sync::oneshot;

const UNKNOWN_WRITE_ERROR: &str = "unknown write error";

/// The server's verdict on a safe write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeWriteResult {
    ok: bool,
    affected: u64,
    error_message: Option<String>,
}

impl SafeWriteResult {
    /// Interprets a confirmation reply.
    ///
    /// A non-null string `err` or `errmsg`, or a falsy `ok`, means the write was rejected.
    /// Otherwise the write succeeded and `n` is the number of documents it touched.
    fn from_confirmation(confirmation: &Document) -> Self {
        let error_message = document::get_message(confirmation, "err")
            .or_else(|| document::get_message(confirmation, "errmsg"));
        let ok_flag = document::get_number(confirmation, "ok").is_some_and(|ok| ok != 0.0);

        if error_message.is_some() || !ok_flag {
            SafeWriteResult {
                ok: false,
                affected: 0,
                error_message: Some(error_message.unwrap_or(UNKNOWN_WRITE_ERROR).to_owned()),
            }
        } else {
            SafeWriteResult {
                ok: true,
                affected: document::get_number(confirmation, "n")
                    .filter(|n| *n > 0.0)
                    .map(|n| n as u64)
                    .unwrap_or(0),
                error_message: None,
            }
        }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn affected(&self) -> u64 {
        self.affected
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Turns a rejected write into [`DriverError::WriteRejected`].
    pub fn into_result(self) -> Result<SafeWriteResult, DriverError> {
        if self.ok {
            Ok(self)
        } else {
            Err(DriverError::WriteRejected {
                message: self
                    .error_message
                    .unwrap_or_else(|| UNKNOWN_WRITE_ERROR.to_owned()),
            })
        }
    }
}

/// The two requests that make up one safe write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainedWrite {
    pub write_id: RequestId,
    pub confirmation_id: RequestId,
    pub connection: ConnectionId,
}

/// How a chained write ended.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The confirmation arrived, the server may still have rejected the write.
    Confirmed(SafeWriteResult),
    /// The write was sent but the confirmation was lost, the write may or may not have been applied.
    Indeterminate(DriverError),
}

impl ChainOutcome {
    pub fn into_result(self, write_id: RequestId) -> Result<SafeWriteResult, DriverError> {
        match self {
            ChainOutcome::Confirmed(result) => Ok(result),
            ChainOutcome::Indeterminate(cause) => Err(DriverError::IndeterminateWrite {
                write_id,
                cause: Box::new(cause),
            }),
        }
    }
}

/// A chained write whose frames have been queued, awaiting its confirmation.
#[derive(Debug)]
pub struct PendingChain {
    chain: ChainedWrite,
    confirmation_rx: oneshot::Receiver<Response>,
}

impl PendingChain {
    pub fn chain(&self) -> ChainedWrite {
        self.chain
    }

    /// Wait for the confirmation, which `reaper` times out if the server never answers it.
    pub async fn outcome(self, reaper: &Reaper) -> ChainOutcome {
        let ChainedWrite {
            write_id,
            confirmation_id,
            connection,
        } = self.chain;
        match reaper.wait(confirmation_id, self.confirmation_rx).await {
            Ok(Ok(payload)) => ChainOutcome::Confirmed(parse_confirmation(confirmation_id, payload)),
            Ok(Err(cause)) => {
                tracing::warn!("confirmation {confirmation_id} of write {write_id} was lost: {cause}");
                ChainOutcome::Indeterminate(cause)
            }
            // the store drops its sender without resolving only when the entry vanished, treat like a closed link
            Err(_) => ChainOutcome::Indeterminate(DriverError::ConnectionClosed {
                request_id: confirmation_id,
                connection,
                cause: anyhow!("confirmation was dropped unresolved"),
            }),
        }
    }
}

fn parse_confirmation(confirmation_id: RequestId, payload: Payload) -> SafeWriteResult {
    match payload.first_document() {
        Some(confirmation) => SafeWriteResult::from_confirmation(confirmation),
        None => {
            tracing::error!("confirmation {confirmation_id} came back without a document");
            SafeWriteResult::from_confirmation(&Document::new())
        }
    }
}

/// Issues writes followed by their confirmation on a single connection.
pub struct SafeWriteCoordinator<'a> {
    store: &'a PendingRequestStore,
}

impl<'a> SafeWriteCoordinator<'a> {
    pub fn new(store: &'a PendingRequestStore) -> Self {
        SafeWriteCoordinator { store }
    }

    /// Registers the confirmation and queues the write followed by the confirmation on `connection`.
    ///
    /// Nothing here awaits, so no other request can be queued on `connection` between the two frames.
    /// Only the confirmation is registered, with its `chained_id` pointing at the write.
    ///
    /// A write that could not be queued was never sent, it fails with a retryable
    /// [`DriverError::ConnectionClosed`]. Once the write is queued any failure leaves its outcome unknown.
    pub fn dispatch(
        &self,
        connection: &Connection,
        write_id: RequestId,
        confirmation_id: RequestId,
        write: Operation,
    ) -> Result<PendingChain, DriverError> {
        let chain = ChainedWrite {
            write_id,
            confirmation_id,
            connection: connection.id(),
        };
        let confirmation = Operation::last_error(write.database());
        let confirmation_rx = self.store.register_chained(
            confirmation_id,
            ResultShape::Documents,
            connection.id(),
            Some(write_id),
        )?;

        if let Err(err) = connection.send(OutgoingFrame {
            request_id: write_id,
            operation: write,
        }) {
            self.store.reject_once(
                confirmation_id,
                DriverError::ConnectionClosed {
                    request_id: confirmation_id,
                    connection: connection.id(),
                    cause: anyhow!("write {write_id} was never sent"),
                },
            );
            return Err(err);
        }
        if let Err(err) = connection.send(OutgoingFrame {
            request_id: confirmation_id,
            operation: confirmation,
        }) {
            self.store.reject_once(confirmation_id, err);
        }
        tracing::trace!("queued write {write_id} with confirmation {confirmation_id} on {}", chain.connection);

        Ok(PendingChain {
            chain,
            confirmation_rx,
        })
    }
}
