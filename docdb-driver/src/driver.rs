use crate::codec::{CodecBuilder, JsonCodecBuilder};
use crate::config::DriverConfig;
use crate::document;
use crate::error::DriverError;
use crate::frame::{OutgoingFrame, Payload, RequestId, RequestIdGenerator, ResultShape};
use crate::operation::Operation;
use crate::pool::{Connection, ConnectionPool};
use crate::reaper::Reaper;
use crate::safe_write::{SafeWriteCoordinator, SafeWriteResult};
use crate::store::PendingRequestStore;
use crate::validation::AdmissionValidator;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What a successfully submitted operation resolved to.
#[derive(Debug)]
pub enum Reply {
    Payload(Payload),
    /// The server's verdict on an acknowledged write, which may be a rejection.
    SafeWrite(SafeWriteResult),
    /// A write sent without asking for acknowledgment.
    Unacknowledged,
}

impl Reply {
    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Reply::Payload(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_safe_write(self) -> Option<SafeWriteResult> {
        match self {
            Reply::SafeWrite(result) => Some(result),
            _ => None,
        }
    }
}

/// The entry point for everything sent to the server.
pub struct Driver<C: CodecBuilder = JsonCodecBuilder> {
    config: DriverConfig,
    store: Arc<PendingRequestStore>,
    pool: ConnectionPool<C>,
    reaper: Arc<Reaper>,
    request_ids: RequestIdGenerator,
    validator: AdmissionValidator,
    shutdown_tx: watch::Sender<bool>,
    reaper_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        Driver::with_codec(config, JsonCodecBuilder)
    }
}

impl<C: CodecBuilder> Driver<C> {
    /// Nothing is connected until [`Driver::open`] is called.
    pub fn with_codec(config: DriverConfig, codec: C) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(PendingRequestStore::new());
        let pool = ConnectionPool::new(config.pool_config(), codec, store.clone());
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            config.request_timeout(),
            config.sweep_interval(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Driver {
            validator: AdmissionValidator::new(config.modifier_exemption),
            config,
            store,
            pool,
            reaper,
            request_ids: RequestIdGenerator::new(),
            shutdown_tx,
            reaper_timer: Mutex::new(None),
        })
    }

    /// Connect the pool and start the reaper timer unless sweeps are left to request admission.
    pub async fn open(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(anyhow!("the driver for {} was closed", self.config.address));
        }
        self.pool.open().await?;
        if self.config.reaper_timer {
            let mut timer = self.reaper_timer.lock().unwrap_or_else(PoisonError::into_inner);
            if timer.is_none() {
                *timer = Some(self.reaper.spawn_timer(self.shutdown_tx.subscribe()));
            }
        }
        tracing::debug!(
            "driver connected to {} with {} of {} connections healthy",
            self.config.address,
            self.pool.healthy_count(),
            self.pool.capacity()
        );
        Ok(())
    }

    /// Close every connection, resolving all pending requests with `ConnectionClosed`, and stop the reaper timer.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
        self.pool.close();
    }

    /// Validate, send and await `operation`.
    ///
    /// Queries go to a reader connection, everything else to a writer.
    /// When `safe` is set a write is followed by a confirmation and resolves to [`Reply::SafeWrite`],
    /// an unsafe write resolves to [`Reply::Unacknowledged`] as soon as it is queued.
    pub async fn submit(
        &self,
        operation: Operation,
        result_shape: ResultShape,
        safe: bool,
    ) -> Result<Reply, DriverError> {
        self.validator.validate_operation(&operation)?;

        self.reaper.maybe_sweep();

        let connection = match operation {
            Operation::Query { .. } => self.pool.checkout_reader().await?,
            _ => self.pool.checkout_writer().await?,
        };
        tracing::trace!("submitting {} on connection {}", operation.kind(), connection.id());

        if operation.is_write() {
            let write_id = self.next_request_id();
            if !safe {
                connection.send(OutgoingFrame {
                    request_id: write_id,
                    operation,
                })?;
                return Ok(Reply::Unacknowledged);
            }
            let confirmation_id = self.next_request_id();
            let pending = SafeWriteCoordinator::new(&self.store).dispatch(
                &connection,
                write_id,
                confirmation_id,
                operation,
            )?;
            self.reject_if_link_died(&connection, confirmation_id);
            let result = pending.outcome(&self.reaper).await.into_result(write_id)?;
            return Ok(Reply::SafeWrite(result));
        }

        let request_id = self.next_request_id();
        let is_command = operation.is_command();
        let rx = self.store.register(request_id, result_shape, connection.id())?;
        if let Err(err) = connection.send(OutgoingFrame {
            request_id,
            operation,
        }) {
            self.store.reject_once(request_id, err);
        }
        self.reject_if_link_died(&connection, request_id);

        let payload = self
            .reaper
            .wait(request_id, rx)
            .await
            .map_err(|_| DriverError::ConnectionClosed {
                request_id,
                connection: connection.id(),
                cause: anyhow!("request was dropped unresolved"),
            })??;

        if is_command {
            check_command_reply(&payload)?;
        }
        Ok(Reply::Payload(payload))
    }

    /// Closes the window between checkout and registration: if the link failed in between,
    /// its requests were already cancelled and `request_id` would otherwise wait for the reaper.
    fn reject_if_link_died(&self, connection: &Connection, request_id: RequestId) {
        if !self.pool.is_live(connection.id()) {
            self.store.reject_once(
                request_id,
                DriverError::ConnectionClosed {
                    request_id,
                    connection: connection.id(),
                    cause: anyhow!("the connection failed while the request was being sent"),
                },
            );
        }
    }

    /// Ids wrap around, skip any that are still pending.
    fn next_request_id(&self) -> RequestId {
        loop {
            let id = self.request_ids.next_id();
            if !self.store.contains(id) {
                return id;
            }
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Whether callers must verify that a collection exists before using it,
    /// reporting [`DriverError::CollectionDoesNotExist`] when it does not.
    pub fn strict_mode(&self) -> bool {
        self.config.strict_mode
    }

    pub fn store(&self) -> &Arc<PendingRequestStore> {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }
}

fn check_command_reply(payload: &Payload) -> Result<(), DriverError> {
    // raw replies are handed back uninterpreted
    let Some(reply) = payload.first_document() else {
        return Ok(());
    };
    if document::get_number(reply, "ok").is_some_and(|ok| ok != 0.0) {
        Ok(())
    } else {
        Err(DriverError::CommandFailed {
            message: document::get_message(reply, "errmsg")
                .unwrap_or("command failed")
                .to_owned(),
        })
    }
}
