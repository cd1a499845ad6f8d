//! Durable retry queue.
//!
//! Mutating actions that could not reach the service are persisted here and
//! replayed in insertion order. A network failure leaves everything in place
//! and schedules a retry with exponential backoff; a rejection by the service
//! annotates the failed item, which then blocks everything behind it until
//! it succeeds or is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff;
use super::item::{PayloadError, QueueAction, QueueItem, QueueStatus};
use crate::api::{ApiError, CallOptions, FailureKind, NetworkGateway};
use crate::auth::CredentialVault;
use crate::connectivity::Connectivity;
use crate::events::{EventBus, SyncEvent};
use crate::store::{keys, load_json, save_json, KeyValueStore};

/// Minimum spacing between offline notices from forced flushes.
const OFFLINE_NOTICE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Invalid(#[from] PayloadError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What a flush call did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Another flush was already running
    Busy,
    /// Connectivity is down; a retry was scheduled
    Offline,
    /// Nothing to send
    Empty,
    /// Every item present at the start was sent
    Drained { sent: usize },
    /// A network failure stopped the flush; a retry was scheduled
    Deferred { sent: usize, error: ApiError },
    /// The service rejected an item, which now blocks the queue
    Blocked { sent: usize, id: String, error: ApiError },
}

/// Clears the flushing flag when dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ArmedTimer {
    generation: u64,
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RetryState {
    retry_count: u32,
    timer: Option<ArmedTimer>,
    /// Incremented per armed timer so a stale timer cannot disarm a newer one
    generation: u64,
    last_offline_notice: Option<Instant>,
}

pub struct RetryQueue {
    store: Arc<dyn KeyValueStore>,
    gateway: Arc<NetworkGateway>,
    vault: Arc<CredentialVault>,
    connectivity: Connectivity,
    events: EventBus,
    items: Mutex<Vec<QueueItem>>,
    flushing: AtomicBool,
    state: Mutex<RetryState>,
    wake: Notify,
}

impl RetryQueue {
    /// Restore the queue from the store.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        gateway: Arc<NetworkGateway>,
        vault: Arc<CredentialVault>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let items: Vec<QueueItem> = load_json(store.as_ref(), keys::QUEUE)
            .context("Failed to load retry queue")?
            .unwrap_or_default();
        if !items.is_empty() {
            info!(pending = items.len(), "Restored retry queue");
        }
        let connectivity = gateway.connectivity().clone();
        Ok(Arc::new(Self {
            store,
            gateway,
            vault,
            connectivity,
            events,
            items: Mutex::new(items),
            flushing: AtomicBool::new(false),
            state: Mutex::new(RetryState::default()),
            wake: Notify::new(),
        }))
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, items: &[QueueItem]) -> Result<()> {
        save_json(self.store.as_ref(), keys::QUEUE, items).context("Failed to save retry queue")
    }

    /// Apply `f` to the items and persist the result. Persistence failures
    /// are logged; the in-memory queue stays authoritative.
    fn update_items<R>(&self, f: impl FnOnce(&mut Vec<QueueItem>) -> R) -> R {
        let mut items = self.lock_items();
        let result = f(&mut items);
        if let Err(e) = self.persist(&items) {
            warn!(error = %e, "Queue persistence failed");
        }
        result
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Validate and append an action. The item is persisted before this
    /// returns; if online a flush is scheduled.
    pub fn enqueue(self: &Arc<Self>, action: QueueAction) -> Result<QueueItem, QueueError> {
        action.validate()?;
        let item = QueueItem::new(action);
        {
            let mut items = self.lock_items();
            items.push(item.clone());
            if let Err(e) = self.persist(&items) {
                items.pop();
                return Err(e.into());
            }
        }
        info!(id = %item.id, kind = %item.kind(), "Action queued");
        self.publish_status();
        if self.connectivity.is_online() {
            self.schedule_flush();
        }
        Ok(item)
    }

    /// Snapshot of the queued items, head first.
    pub fn items(&self) -> Vec<QueueItem> {
        self.lock_items().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    /// Drop an item without sending it. Returns whether it was queued.
    pub fn discard(self: &Arc<Self>, id: &str) -> Result<bool, QueueError> {
        let removed = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|item| item.id != id);
            if items.len() == before {
                false
            } else {
                self.persist(&items)?;
                true
            }
        };
        if removed {
            info!(id, "Queued action discarded");
            self.publish_status();
            if self.connectivity.is_online() {
                self.schedule_flush();
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> QueueStatus {
        let (pending, blocked) = {
            let items = self.lock_items();
            (items.len(), QueueStatus::blocked_by(&items))
        };
        let (retry_count, next_retry_at) = {
            let state = self.lock_state();
            (state.retry_count, state.timer.as_ref().map(|t| t.deadline))
        };
        QueueStatus {
            pending,
            blocked,
            online: self.connectivity.is_online(),
            flushing: self.flushing.load(Ordering::Acquire),
            retry_count,
            next_retry_at,
            last_sync: self.gateway.last_sync(),
        }
    }

    pub fn publish_status(&self) {
        self.events.publish(SyncEvent::Status(self.status()));
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Replay queued actions head to tail. A forced flush resets the backoff
    /// and cancels any armed retry timer first.
    pub async fn flush(self: &Arc<Self>, force: bool) -> FlushOutcome {
        let Some(guard) = FlushGuard::acquire(&self.flushing) else {
            debug!("Flush already in progress");
            return FlushOutcome::Busy;
        };

        if force {
            self.lock_state().retry_count = 0;
            self.cancel_timer();
        }

        if !self.connectivity.is_online() {
            if force {
                self.offline_notice();
            }
            drop(guard);
            self.schedule_flush();
            self.publish_status();
            return FlushOutcome::Offline;
        }

        let snapshot = self.items();
        if snapshot.is_empty() {
            drop(guard);
            self.publish_status();
            return FlushOutcome::Empty;
        }

        debug!(pending = snapshot.len(), force, "Flushing retry queue");
        self.publish_status();

        let mut sent = 0;
        let mut failure = None;
        for item in &snapshot {
            let body = item.action.payload_value();
            let result = self
                .gateway
                .call(item.action.endpoint(), Method::POST, Some(&body), &CallOptions::default())
                .await;

            match result {
                Ok(_) => {
                    sent += 1;
                    debug!(id = %item.id, kind = %item.kind(), "Queued action sent");
                    self.update_items(|items| items.retain(|queued| queued.id != item.id));
                }
                Err(e) => {
                    let kind = e.classify(self.connectivity.is_online());
                    if kind == FailureKind::Logical {
                        warn!(id = %item.id, kind = %item.kind(), error = %e, "Queued action rejected");
                        let message = e.to_string();
                        self.update_items(|items| {
                            if let Some(queued) = items.iter_mut().find(|queued| queued.id == item.id) {
                                queued.mark_failed(message);
                            }
                        });
                    } else {
                        warn!(id = %item.id, error = %e, "Network failure during flush");
                        self.update_items(|_| ());
                    }
                    failure = Some((item.id.clone(), e, kind));
                    break;
                }
            }
        }

        let outcome = match failure {
            None if !self.is_empty() => {
                // Enqueued while this flush held the guard; their timer may
                // already have fired into a busy flush
                debug!(sent, remaining = self.len(), "Items arrived during flush");
                drop(guard);
                self.schedule_flush();
                self.publish_status();
                return FlushOutcome::Drained { sent };
            }
            None => {
                self.lock_state().retry_count = 0;
                self.cancel_timer();
                info!(sent, "Retry queue drained");
                self.events.publish(SyncEvent::FlushSucceeded(sent));
                if self.vault.has_session() {
                    self.events.publish(SyncEvent::RefreshView);
                }
                FlushOutcome::Drained { sent }
            }
            Some((_, error, FailureKind::Network)) => {
                {
                    let mut state = self.lock_state();
                    state.retry_count = backoff::next_retry_count(state.retry_count);
                }
                drop(guard);
                self.schedule_flush();
                self.publish_status();
                return FlushOutcome::Deferred { sent, error };
            }
            Some((id, error, FailureKind::Logical)) => FlushOutcome::Blocked { sent, id, error },
        };

        drop(guard);
        self.publish_status();
        outcome
    }

    fn offline_notice(&self) {
        let now = Instant::now();
        let mut state = self.lock_state();
        let due = state
            .last_offline_notice
            .map_or(true, |last| now.duration_since(last) >= OFFLINE_NOTICE_INTERVAL);
        if due {
            state.last_offline_notice = Some(now);
            drop(state);
            self.events.publish(SyncEvent::OfflineNotice);
        }
    }

    /// Arm the one-shot retry timer. No-op while a timer is armed or the
    /// queue is empty.
    pub fn schedule_flush(self: &Arc<Self>) {
        if self.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; retry not scheduled");
            return;
        };

        let mut state = self.lock_state();
        if state.timer.is_some() {
            return;
        }

        let delay = backoff::retry_delay(state.retry_count);
        state.generation += 1;
        let generation = state.generation;
        let queue: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.timer_fired(generation);
            }
        });
        let deadline = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        debug!(delay_ms = delay.as_millis() as u64, retry_count = state.retry_count, "Retry scheduled");
        state.timer = Some(ArmedTimer {
            generation,
            deadline,
            handle,
        });
    }

    fn timer_fired(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
                return;
            }
            state.timer = None;
        }
        self.wake.notify_one();
    }

    /// Disarm the retry timer, if any.
    pub fn cancel_timer(&self) {
        if let Some(timer) = self.lock_state().timer.take() {
            timer.handle.abort();
        }
    }

    /// Drive timer-triggered flushes. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            let outcome = self.flush(false).await;
            debug!(?outcome, "Scheduled flush finished");
        }
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        if let Some(timer) = self.lock_state().timer.take() {
            timer.handle.abort();
        }
    }
}
