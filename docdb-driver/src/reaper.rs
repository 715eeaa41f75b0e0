//! Forced resolution of requests whose replies never arrive.
//!
//! The reaper is either idle or sweeping. A sweep is triggered by the timer task spawned with
//! [`Reaper::spawn_timer`], or piggy-backs on request admission through [`Reaper::maybe_sweep`]
//! once `sweep_interval` has passed since the previous sweep.
//! Callers waiting through [`Reaper::wait`] are never left pending past `request_timeout + sweep_interval`,
//! even when neither trigger fires.
//!
//! A sweep only inspects the in-memory store, it never waits on IO.
//! Only one sweep runs at a time, a reply that lands mid-sweep is still handled correctly because both sides
//! resolve through the store's compare-and-swap, not because the sweep excludes them.

use crate::frame::RequestId;
use crate::store::{PendingRequestStore, Response};
use atomic_enum::atomic_enum;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

#[atomic_enum]
#[derive(PartialEq)]
pub enum ReaperState {
    Idle,
    Sweeping,
}

pub struct Reaper {
    store: Arc<PendingRequestStore>,
    request_timeout: Duration,
    sweep_interval: Duration,
    state: AtomicReaperState,
    last_sweep_at: Mutex<Instant>,
}

impl Reaper {
    pub fn new(store: Arc<PendingRequestStore>, request_timeout: Duration, sweep_interval: Duration) -> Self {
        Reaper {
            store,
            request_timeout,
            sweep_interval,
            state: AtomicReaperState::new(ReaperState::Idle),
            last_sweep_at: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ReaperState {
        self.state.load(Ordering::Acquire)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn last_sweep_at(&self) -> Instant {
        *self.last_sweep_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overrides when the previous sweep happened, e.g. to force the next admission to sweep.
    pub fn set_last_sweep_at(&self, at: Instant) {
        *self.last_sweep_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Whether enough time has passed since the last sweep for admission to trigger one.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sweep_at()) >= self.sweep_interval
    }

    /// Sweep if one is due, returning the reaped ids.
    pub fn maybe_sweep(&self) -> Vec<RequestId> {
        if self.is_due(Instant::now()) {
            self.sweep()
        } else {
            vec![]
        }
    }

    /// Reap every request older than the request timeout.
    /// If another sweep is already running this returns immediately without reaping anything.
    pub fn sweep(&self) -> Vec<RequestId> {
        if self
            .state
            .compare_exchange(
                ReaperState::Idle,
                ReaperState::Sweeping,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::trace!("skipping sweep, another sweep is in progress");
            return vec![];
        }

        let reaped = self.store.timeout_all(self.request_timeout);
        self.set_last_sweep_at(Instant::now());
        self.state.store(ReaperState::Idle, Ordering::Release);

        if !reaped.is_empty() {
            tracing::debug!("reaper timed out {} requests: {reaped:?}", reaped.len());
        }
        reaped
    }

    /// Await the result of `id`.
    ///
    /// Should no sweep have resolved it by `request_timeout + sweep_interval` after registration,
    /// a sweep is run on the spot and `id` is timed out if that sweep was refused or missed it.
    pub async fn wait(
        &self,
        id: RequestId,
        mut rx: oneshot::Receiver<Response>,
    ) -> Result<Response, RecvError> {
        let bound = self.request_timeout.saturating_add(self.sweep_interval);
        let deadline = self
            .store
            .get(id)
            .and_then(|pending| pending.started_at.checked_add(bound));
        // already resolved, or a deadline too far out to represent
        let Some(deadline) = deadline else {
            return rx.await;
        };
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(response) => response,
            Err(_) => {
                self.sweep();
                if self.store.timeout_one(id) {
                    tracing::debug!("request {id} passed its deadline without a sweep");
                }
                rx.await
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown_rx` reports true or its sender is dropped.
    pub fn spawn_timer(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(reaper.sweep_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the first tick completes immediately
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            reaper.sweep();
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                tracing::debug!("reaper timer stopped");
                                return;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }
}
