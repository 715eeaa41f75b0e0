//! Tracks every request that has been sent but not yet answered.
//!
//! Three independent actors resolve entries: the connection reader task when a reply arrives,
//! the [`crate::reaper::Reaper`] when an entry grows stale, and the pool when a connection dies.
//! They all go through [`PendingRequestStore::claim`], which flips the entry's resolved flag with a single
//! atomic swap while holding the map lock, so exactly one of them gets to deliver a result.

use crate::error::DriverError;
use crate::frame::{Payload, RequestId, ResultShape};
use crate::pool::ConnectionId;
use anyhow::anyhow;
use bytes::Bytes;
use metrics::{counter, Counter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Response = Result<Payload, DriverError>;

struct PendingRequest {
    id: RequestId,
    started_at: Instant,
    result_shape: ResultShape,
    chained_id: Option<RequestId>,
    // Only used to find the requests of a dead connection, never to identify a request
    connection: ConnectionId,
    resolved: AtomicBool,
    waiter: Mutex<Option<oneshot::Sender<Response>>>,
}

impl PendingRequest {
    fn deliver(&self, response: Response) {
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiter) = waiter {
            // The caller is allowed to stop waiting, in that case the result is discarded.
            waiter.send(response).ok();
        }
    }
}

/// A read-only view of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: RequestId,
    pub started_at: Instant,
    pub result_shape: ResultShape,
    pub chained_id: Option<RequestId>,
    pub connection: ConnectionId,
}

pub struct PendingRequestStore {
    pending: Mutex<HashMap<RequestId, Arc<PendingRequest>>>,
    reaped: Counter,
    cancelled: Counter,
    late_replies: Counter,
}

impl Default for PendingRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestStore {
    pub fn new() -> Self {
        PendingRequestStore {
            pending: Mutex::new(HashMap::new()),
            reaped: counter!("docdb_requests_reaped_total"),
            cancelled: counter!("docdb_requests_cancelled_total"),
            late_replies: counter!("docdb_late_replies_total"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Arc<PendingRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `id`, the returned receiver yields its one and only result.
    pub fn register(
        &self,
        id: RequestId,
        result_shape: ResultShape,
        connection: ConnectionId,
    ) -> Result<oneshot::Receiver<Response>, DriverError> {
        self.register_chained(id, result_shape, connection, None)
    }

    /// Like [`Self::register`] but records that this request belongs to the request `chained_id`.
    /// Safe writes use this to tie the confirmation query to the write it confirms.
    pub fn register_chained(
        &self,
        id: RequestId,
        result_shape: ResultShape,
        connection: ConnectionId,
        chained_id: Option<RequestId>,
    ) -> Result<oneshot::Receiver<Response>, DriverError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(DriverError::DuplicateRequestId(id));
        }
        pending.insert(
            id,
            Arc::new(PendingRequest {
                id,
                started_at: Instant::now(),
                result_shape,
                chained_id,
                connection,
                resolved: AtomicBool::new(false),
                waiter: Mutex::new(Some(tx)),
            }),
        );
        tracing::trace!("registered request {id} on connection {connection}");
        Ok(rx)
    }

    /// Removes and returns the entry for `id` if the caller won the right to resolve it.
    fn claim(&self, id: RequestId) -> Option<Arc<PendingRequest>> {
        let mut pending = self.lock();
        let entry = pending.get(&id)?;
        if entry.resolved.swap(true, Ordering::AcqRel) {
            return None;
        }
        pending.remove(&id)
    }

    /// Deliver the reply `body` to whoever is waiting on `id`.
    ///
    /// Returns false without doing anything if `id` is unknown or was already resolved,
    /// which is the expected outcome for a reply that arrives after its request was reaped.
    pub fn resolve_once(&self, id: RequestId, body: Bytes) -> bool {
        match self.claim(id) {
            Some(entry) => {
                let response = Payload::decode(entry.result_shape, body)
                    .map_err(|cause| DriverError::Decode { request_id: id, cause });
                entry.deliver(response);
                true
            }
            None => {
                self.late_replies.increment(1);
                tracing::debug!("dropping reply to request {id}, it is no longer pending");
                false
            }
        }
    }

    /// Resolve `id` with a failure, under the same at-most-once rule as [`Self::resolve_once`].
    pub fn reject_once(&self, id: RequestId, error: DriverError) -> bool {
        match self.claim(id) {
            Some(entry) => {
                entry.deliver(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve every request that has been waiting longer than `older_than` with [`DriverError::Timeout`].
    /// Returns the ids that were reaped, in ascending order.
    pub fn timeout_all(&self, older_than: Duration) -> Vec<RequestId> {
        let now = Instant::now();
        let reaped = self.claim_where(|entry| now.duration_since(entry.started_at) > older_than);

        let ids: Vec<RequestId> = reaped.iter().map(|entry| self.expire(entry, now)).collect();
        self.reaped.increment(ids.len() as u64);
        ids
    }

    /// Resolve `id` with [`DriverError::Timeout`] regardless of its age.
    pub fn timeout_one(&self, id: RequestId) -> bool {
        match self.claim(id) {
            Some(entry) => {
                self.expire(&entry, Instant::now());
                self.reaped.increment(1);
                true
            }
            None => false,
        }
    }

    fn expire(&self, entry: &PendingRequest, now: Instant) -> RequestId {
        let elapsed = now.duration_since(entry.started_at);
        tracing::warn!(
            "request {} on connection {} timed out after {elapsed:?}",
            entry.id,
            entry.connection
        );
        entry.deliver(Err(DriverError::Timeout {
            request_id: entry.id,
            elapsed,
        }));
        entry.id
    }

    /// Resolve every request sent on `connection` with [`DriverError::ConnectionClosed`].
    /// Returns the ids that were cancelled, in ascending order.
    pub fn cancel(&self, connection: ConnectionId, cause: &str) -> Vec<RequestId> {
        let cancelled = self.claim_where(|entry| entry.connection == connection);

        let mut ids = Vec::with_capacity(cancelled.len());
        for entry in cancelled {
            entry.deliver(Err(DriverError::ConnectionClosed {
                request_id: entry.id,
                connection,
                cause: anyhow!(cause.to_owned()),
            }));
            ids.push(entry.id);
        }
        if !ids.is_empty() {
            tracing::warn!(
                "cancelled {} pending requests on connection {connection}: {cause}",
                ids.len()
            );
        }
        self.cancelled.increment(ids.len() as u64);
        ids
    }

    fn claim_where(&self, predicate: impl Fn(&PendingRequest) -> bool) -> Vec<Arc<PendingRequest>> {
        let mut pending = self.lock();
        let mut ids: Vec<RequestId> = pending
            .values()
            .filter(|entry| predicate(entry))
            .filter(|entry| !entry.resolved.swap(true, Ordering::AcqRel))
            .map(|entry| entry.id)
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| pending.remove(id)).collect()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn get(&self, id: RequestId) -> Option<PendingInfo> {
        self.lock().get(&id).map(|entry| PendingInfo {
            id: entry.id,
            started_at: entry.started_at,
            result_shape: entry.result_shape,
            chained_id: entry.chained_id,
            connection: entry.connection,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}
