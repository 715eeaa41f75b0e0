//! A fixed set of connections to one server endpoint.
//!
//! Each slot holds at most one live link. A link is a pair of tasks:
//! the writer encodes frames handed to it by [`Connection::send`] and the reader decodes replies and
//! resolves them through the [`PendingRequestStore`].
//! When either task hits an error the slot is marked unhealthy and every request sent on that link is cancelled.
//!
//! Shutdown flows
//!
//! The server closes the connection or an IO error occurs:
//! 1. The reader or writer task returns a `ConnectionError`.
//! 2. The slot is marked unhealthy and its sender is dropped, so no new checkout can pick it.
//! 3. The other task of the link is aborted.
//! 4. Every pending request on the link is resolved with `ConnectionClosed`.
//! 5. If auto reconnect is enabled a reconnect loop is spawned for the slot.
//!
//! The pool is closed:
//! 1. Every slot is marked closed and its tasks are aborted.
//! 2. Every pending request on every link is resolved with `ConnectionClosed`.

use crate::codec::{CodecBuilder, CodecReadError, CodecWriteError};
use crate::error::DriverError;
use crate::frame::{IncomingFrame, OutgoingFrame};
use crate::store::PendingRequestStore;
use crate::tcp;
use anyhow::{anyhow, Result};
use derivative::Derivative;
use futures::{SinkExt, StreamExt};
use metrics::{counter, Counter};
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

/// Identifies one physical link. A slot that reconnects gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Reader,
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    Unhealthy,
    Closed,
}

/// This represents an unrecoverable error on a link.
/// The link is no longer usable after this error is received.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("The server closed the connection")]
    OtherSideClosed,
    #[error("The connection pool was closed")]
    PoolClosed,
    #[error("Marked unhealthy: {0}")]
    MarkedUnhealthy(String),
    #[error("Message decode error {0}")]
    MessageDecode(Arc<anyhow::Error>),
    #[error("Message encode error {0}")]
    MessageEncode(Arc<anyhow::Error>),
    #[error("IO error {0}")]
    Io(Arc<std::io::Error>),
}

/// A link checked out of the pool for the duration of one send.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    #[derivative(Debug = "ignore")]
    out_tx: UnboundedSender<OutgoingFrame>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a frame for the writer task.
    /// Frames queued on the same connection are written in the order they were queued.
    pub fn send(&self, frame: OutgoingFrame) -> Result<(), DriverError> {
        let request_id = frame.request_id;
        self.out_tx
            .send(frame)
            .map_err(|_| DriverError::ConnectionClosed {
                request_id,
                connection: self.id,
                cause: anyhow!("the writer task for this connection has shut down"),
            })
    }
}

#[cfg(test)]
impl Connection {
    /// A connection with no link behind it, frames sent on it land in the returned receiver.
    pub(crate) fn detached(
        id: ConnectionId,
        role: Role,
    ) -> (Connection, UnboundedReceiver<OutgoingFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (Connection { id, role, out_tx }, out_rx)
    }
}

struct Link {
    id: Option<ConnectionId>,
    health: ConnectionHealth,
    out_tx: Option<UnboundedSender<OutgoingFrame>>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    fn shutdown(&mut self, health: ConnectionHealth) -> Option<ConnectionId> {
        self.health = health;
        self.out_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.id
    }
}

struct Slot {
    index: usize,
    role: Role,
    link: Mutex<Link>,
    reconnecting: AtomicBool,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases the reconnect flag held by a finishing reconnect loop.
    ///
    /// A link that failed while the flag was still set did not spawn a loop of its own.
    /// Returns true if that happened and the flag was taken back, the caller must then keep reconnecting.
    fn finish_reconnect(&self) -> bool {
        let unhealthy = {
            // cleared under the lock so that a failure recorded after this point sees the flag down
            let link = self.lock();
            self.reconnecting.store(false, Ordering::Release);
            link.health == ConnectionHealth::Unhealthy
        };
        unhealthy && !self.reconnecting.swap(true, Ordering::AcqRel)
    }

    fn checkout(&self) -> Option<Connection> {
        let link = self.lock();
        match (&link.id, link.health, &link.out_tx) {
            (Some(id), ConnectionHealth::Healthy, Some(out_tx)) if !out_tx.is_closed() => Some(Connection {
                id: *id,
                role: self.role,
                out_tx: out_tx.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub address: String,
    pub pool_size: usize,
    pub reader_pool_size: usize,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

struct PoolInner<C: CodecBuilder> {
    config: PoolConfig,
    codec: C,
    store: Arc<PendingRequestStore>,
    slots: Vec<Slot>,
    next_reader: AtomicUsize,
    next_writer: AtomicUsize,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
    reconnect_failures: Counter,
}

#[derive(Clone)]
pub struct ConnectionPool<C: CodecBuilder> {
    inner: Arc<PoolInner<C>>,
}

impl<C: CodecBuilder> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.config.address)
            .field("capacity", &self.inner.slots.len())
            .field("healthy", &self.healthy_count())
            .finish()
    }
}

impl<C: CodecBuilder> ConnectionPool<C> {
    /// Creates the pool with every slot unconnected, call [`Self::open`] to connect them.
    ///
    /// The first `pool_size - reader_pool_size` slots are writers, the rest are readers.
    pub fn new(config: PoolConfig, codec: C, store: Arc<PendingRequestStore>) -> Self {
        let writer_count = config.pool_size.saturating_sub(config.reader_pool_size);
        let slots = (0..config.pool_size)
            .map(|index| Slot {
                index,
                role: if index < writer_count {
                    Role::Writer
                } else {
                    Role::Reader
                },
                link: Mutex::new(Link {
                    id: None,
                    health: ConnectionHealth::Unhealthy,
                    out_tx: None,
                    tasks: vec![],
                }),
                reconnecting: AtomicBool::new(false),
            })
            .collect();
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                codec,
                store,
                slots,
                next_reader: AtomicUsize::new(0),
                next_writer: AtomicUsize::new(0),
                next_connection_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                reconnect_failures: counter!("docdb_reconnect_failures_total"),
            }),
        }
    }

    /// Connect every slot.
    /// Slots that fail to connect stay unhealthy, an error is only returned when no slot could connect.
    pub async fn open(&self) -> Result<()> {
        let mut errors = vec![];
        for slot in &self.inner.slots {
            if let Err(err) = self.inner.connect_slot(slot).await {
                tracing::debug!(
                    "Failed to connect pool slot {}/{} to {} - {err:?}",
                    slot.index + 1,
                    self.inner.slots.len(),
                    self.inner.config.address
                );
                errors.push(err);
            }
        }

        if errors.len() == self.inner.slots.len() {
            if let Some(err) = errors.into_iter().next() {
                // On total failure, propagate any error.
                return Err(err);
            }
        } else if !errors.is_empty() {
            tracing::warn!(
                "attempted {} connections, but only {} succeeded",
                self.inner.slots.len(),
                self.inner.slots.len() - errors.len()
            );
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.lock().health == ConnectionHealth::Healthy)
            .count()
    }

    pub fn health(&self, index: usize) -> Option<ConnectionHealth> {
        self.inner.slots.get(index).map(|slot| slot.lock().health)
    }

    /// Whether `id` is still the live, healthy link of its slot.
    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.inner.slots.iter().any(|slot| {
            let link = slot.lock();
            link.id == Some(id) && link.health == ConnectionHealth::Healthy
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Checkout a connection for a read. When no reader slots are configured reads share the writer slots.
    pub async fn checkout_reader(&self) -> Result<Connection, DriverError> {
        if self.inner.slots.iter().any(|slot| slot.role == Role::Reader) {
            self.checkout(Role::Reader).await
        } else {
            self.checkout(Role::Writer).await
        }
    }

    pub async fn checkout_writer(&self) -> Result<Connection, DriverError> {
        self.checkout(Role::Writer).await
    }

    async fn checkout(&self, role: Role) -> Result<Connection, DriverError> {
        if let Some(connection) = self.inner.try_checkout(role) {
            return Ok(connection);
        }
        if self.inner.config.auto_reconnect && !self.is_closed() {
            tracing::debug!("no healthy {role} connection, attempting to reconnect");
            self.reconnect().await;
            if let Some(connection) = self.inner.try_checkout(role) {
                return Ok(connection);
            }
        }
        Err(DriverError::NoHealthyConnection { role })
    }

    /// Attempt to reconnect every unhealthy slot once. Returns how many slots were restored.
    pub async fn reconnect(&self) -> usize {
        let mut restored = 0;
        for slot in &self.inner.slots {
            if self.is_closed() {
                break;
            }
            if slot.lock().health != ConnectionHealth::Unhealthy {
                continue;
            }
            // This may race a background reconnect loop for the same slot, connect_slot keeps whichever link lands first.
            match self.inner.connect_slot(slot).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    self.inner.reconnect_failures.increment(1);
                    tracing::warn!("Failed to reconnect pool slot {}: {err:?}", slot.index);
                }
            }
        }
        restored
    }

    /// Take `id` out of rotation, cancelling every request that was sent on it.
    pub fn mark_unhealthy(&self, id: ConnectionId, cause: &str) {
        self.inner
            .fail_connection(id, &ConnectionError::MarkedUnhealthy(cause.to_owned()));
    }

    /// Terminate every connection. Pending requests on them are resolved with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<C: CodecBuilder> PoolInner<C> {
    fn try_checkout(&self, role: Role) -> Option<Connection> {
        let candidates: Vec<&Slot> = self.slots.iter().filter(|slot| slot.role == role).collect();
        if candidates.is_empty() || self.closed.load(Ordering::Acquire) {
            return None;
        }
        let cursor = match role {
            Role::Reader => &self.next_reader,
            Role::Writer => &self.next_writer,
        };
        let start = cursor.fetch_add(1, Ordering::Relaxed);
        (0..candidates.len())
            .find_map(|offset| candidates[start.wrapping_add(offset) % candidates.len()].checkout())
    }

    async fn connect_slot(self: &Arc<Self>, slot: &Slot) -> Result<()> {
        let stream = tcp::tcp_stream(self.config.connect_timeout, self.config.address.as_str()).await?;
        let (rx, tx) = stream.into_split();
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));

        let mut link = slot.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("the connection pool was closed while connecting"));
        }
        if link.health == ConnectionHealth::Healthy {
            // lost a race with another reconnect, keep the existing link
            return Ok(());
        }
        let (out_tx, tasks) = spawn_read_write_tasks(self, id, rx, tx);
        *link = Link {
            id: Some(id),
            health: ConnectionHealth::Healthy,
            out_tx: Some(out_tx),
            tasks,
        };
        tracing::debug!(
            "pool slot {} ({}) connected to {} as {} connection {id}",
            slot.index,
            slot.role,
            self.config.address,
            self.codec.protocol_name()
        );
        Ok(())
    }

    fn fail_connection(self: &Arc<Self>, id: ConnectionId, error: &ConnectionError) {
        let Some(slot) = self.slots.iter().find(|slot| slot.lock().id == Some(id)) else {
            return;
        };
        {
            let mut link = slot.lock();
            if link.id != Some(id) || link.health != ConnectionHealth::Healthy {
                // already torn down, the requests were cancelled at that point
                return;
            }
            link.shutdown(ConnectionHealth::Unhealthy);
        }
        // The slot is no longer checkable so nothing new can be registered against `id` after this point.
        tracing::warn!("connection {id} to {} failed: {error}", self.config.address);
        self.store.cancel(id, &error.to_string());

        if self.config.auto_reconnect {
            self.spawn_reconnect(slot.index);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        if slot.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::downgrade(self);
        let interval = self.config.reconnect_interval;
        tokio::spawn(
            async move {
                reconnect_loop(pool, index, interval).await;
            }
            .in_current_span(),
        );
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            let id = slot.lock().shutdown(ConnectionHealth::Closed);
            if let Some(id) = id {
                self.store.cancel(id, &ConnectionError::PoolClosed.to_string());
            }
        }
        tracing::debug!("connection pool to {} closed", self.config.address);
    }
}

impl<C: CodecBuilder> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reconnect_loop<C: CodecBuilder>(pool: Weak<PoolInner<C>>, index: usize, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        let slot = &pool.slots[index];
        if !pool.closed.load(Ordering::Acquire) && slot.lock().health == ConnectionHealth::Unhealthy {
            if let Err(err) = pool.connect_slot(slot).await {
                pool.reconnect_failures.increment(1);
                tracing::warn!("Failed to reconnect pool slot {index}, retrying in {interval:?}: {err:?}");
                continue;
            }
            tracing::info!("reconnected pool slot {index} to {}", pool.config.address);
        }

        if pool.closed.load(Ordering::Acquire) {
            slot.reconnecting.store(false, Ordering::Release);
            return;
        }
        if !slot.finish_reconnect() {
            return;
        }
        tracing::debug!("pool slot {index} failed again before its reconnect loop finished");
    }
}

fn spawn_read_write_tasks<
    C: CodecBuilder,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
>(
    pool: &Arc<PoolInner<C>>,
    id: ConnectionId,
    rx: R,
    tx: W,
) -> (UnboundedSender<OutgoingFrame>, Vec<AbortHandle>) {
    let (decoder, encoder) = pool.codec.build();
    let reader = FramedRead::new(rx, decoder);
    let writer = FramedWrite::new(tx, encoder);
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let store = pool.store.clone();
    let reader_pool = Arc::downgrade(pool);
    let reader_handle = tokio::spawn(
        async move {
            let error = reader_task::<C, _>(reader, &store).await;
            match reader_pool.upgrade() {
                Some(pool) => pool.fail_connection(id, &error),
                // the pool is gone, make sure nobody is left waiting on this link
                None => {
                    store.cancel(id, &error.to_string());
                }
            }
        }
        .in_current_span(),
    );

    let writer_pool = Arc::downgrade(pool);
    let writer_handle = tokio::spawn(
        async move {
            match writer_task::<C, _>(writer, out_rx).await {
                Ok(()) => tracing::trace!("connection {id} writer closed gracefully"),
                Err(error) => {
                    if let Some(pool) = writer_pool.upgrade() {
                        pool.fail_connection(id, &error);
                    }
                }
            }
        }
        .in_current_span(),
    );

    (
        out_tx,
        vec![reader_handle.abort_handle(), writer_handle.abort_handle()],
    )
}

/// Only returns once the link is dead.
async fn reader_task<C: CodecBuilder, R: AsyncRead + Unpin + Send + 'static>(
    mut reader: FramedRead<R, C::Decoder>,
    store: &PendingRequestStore,
) -> ConnectionError {
    loop {
        match reader.next().await {
            Some(Ok(IncomingFrame { response_to, body })) => {
                tracing::trace!("received reply to request {response_to}");
                // Losing the race to the reaper is expected, the store logs and counts it.
                store.resolve_once(response_to, body);
            }
            Some(Err(CodecReadError::Parser(err))) => {
                return ConnectionError::MessageDecode(Arc::new(err));
            }
            Some(Err(CodecReadError::Io(err))) => {
                return ConnectionError::Io(Arc::new(err));
            }
            None => return ConnectionError::OtherSideClosed,
        }
    }
}

async fn writer_task<C: CodecBuilder, W: AsyncWrite + Unpin + Send + 'static>(
    mut writer: FramedWrite<W, C::Encoder>,
    mut out_rx: UnboundedReceiver<OutgoingFrame>,
) -> Result<(), ConnectionError> {
    while let Some(frame) = out_rx.recv().await {
        tracing::trace!("sending request {}", frame.request_id);
        match writer.send(frame).await {
            Err(CodecWriteError::Encoder(err)) => {
                return Err(ConnectionError::MessageEncode(Arc::new(err)));
            }
            Err(CodecWriteError::Io(err)) => {
                if matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
                    return Err(ConnectionError::OtherSideClosed);
                } else {
                    return Err(ConnectionError::Io(Arc::new(err)));
                }
            }
            Ok(()) => {}
        }
    }
    // every sender was dropped, the link was shut down
    Ok(())
}
