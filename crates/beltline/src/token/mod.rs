/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Exclusive lease on one dequeued task.
//!
//! A [`TaskToken`] is handed out by the consumer after it won the advisory
//! lock for a task. The token owns the connection holding that lock and
//! drives the task through its lifecycle:
//!
//! 1. [`try_set_started`](TaskToken::try_set_started) stamps the lease on the
//!    task row and arms the connection watchdog.
//! 2. The handler runs, observing [`cancellation`](TaskToken::cancellation).
//! 3. [`try_set_result`](TaskToken::try_set_result) applies the escalation
//!    ladder, persists task and result rows and releases the lock.
//!
//! If the lock connection drops while the token is live, the watchdog
//! reconnects and takes the same lock again. Operations wait for that to
//! finish before touching the connection. When the lock cannot be regained
//! the token is cancelled and released.
//!
//! The lock is released exactly once, whichever path gets there first, and
//! `TokenEvent::Released` fires once with it.

mod lock_handle;
mod stats;
mod watchdog;

pub use lock_handle::LockHandle;
pub use stats::ConnectionStats;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::LeaseRegistry;
use crate::database::{Database, QueueMapping};
use crate::error::QueueError;
use crate::escalation::escalate;
use crate::model::{AbstractTimestamp, QueuedTask, QueuedTaskResult, TaskExecutionResult, TaskStatus};
use crate::result_queue::TaskResultQueue;
use crate::time_provider::TimeProvider;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenState {
    /// Dequeued, not yet started
    Pending = 0,
    Active = 1,
    Completed = 2,
    Cancelled = 3,
}

impl TokenState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TokenState::Pending,
            1 => TokenState::Active,
            2 => TokenState::Completed,
            _ => TokenState::Cancelled,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, TokenState::Pending | TokenState::Active)
    }
}

/// Lifecycle notifications of one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    ConnectionDropped,
    AttemptingToReconnect,
    ConnectionEstablished { backend_pid: i32 },
    ConnectionFailedPermanently { reason: String },
    /// The lock was given up. Fires exactly once.
    Released,
}

/// SQL used by tokens, rendered once per consumer.
#[derive(Debug, Clone)]
pub(crate) struct TokenStatements {
    start: String,
    requeue: String,
    delete: String,
}

impl TokenStatements {
    pub(crate) fn new(mapping: &QueueMapping) -> Self {
        Self {
            start: mapping.render(
                "UPDATE {tasks} SET status = $1, locked_until = $2 WHERE id = $3 AND status = $1",
            ),
            requeue: mapping.render("UPDATE {tasks} SET status = $1, locked_until = $2 WHERE id = $3"),
            delete: mapping.render("DELETE FROM {tasks} WHERE id = $1"),
        }
    }
}

/// Everything a token needs besides its own state.
pub(crate) struct TokenEnvironment {
    pub(crate) db: Database,
    pub(crate) result_queue: Arc<TaskResultQueue>,
    pub(crate) registry: Arc<LeaseRegistry>,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) fault_error_threshold: i32,
    pub(crate) statements: TokenStatements,
}

pub(crate) struct TokenShared {
    task: QueuedTask,
    result: Mutex<QueuedTaskResult>,
    dequeued_at: AbstractTimestamp,
    state: AtomicU8,
    /// Doubles as the reconnect gate: the watchdog holds it while it
    /// replaces the connection.
    lock: tokio::sync::Mutex<Option<LockHandle>>,
    is_locked: AtomicBool,
    released: AtomicBool,
    cancel: CancellationToken,
    events: broadcast::Sender<TokenEvent>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    stats: ConnectionStats,
    env: Arc<TokenEnvironment>,
}

impl TokenShared {
    fn state(&self) -> TokenState {
        TokenState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn emit(&self, event: TokenEvent) {
        let _ = self.events.send(event);
    }

    /// Moves a live token to `state`. Finished tokens keep their state.
    fn finish(&self, state: TokenState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                TokenState::from_u8(current)
                    .is_live()
                    .then_some(state as u8)
            });
    }

    fn fire_released(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.env.registry.release(self.task.id);
        counter!("beltline.tokens.released").increment(1);
        self.emit(TokenEvent::Released);
    }

    /// Gives the lock up. Callers hold the gate.
    async fn release_with(&self, slot: &mut Option<LockHandle>, state: TokenState) {
        self.finish(state);
        self.cancel.cancel();

        if let Some(handle) = slot.take() {
            let confirmed = handle.release().await;
            debug!(task_id = %self.task.id, key = self.task.lock_handle_id, confirmed, "Advisory lock released");
        }
        self.is_locked.store(false, Ordering::Release);
        self.fire_released();
    }
}

impl TokenShared {
    /// Writes the escalated result, then requeues or deletes the task row.
    async fn record_result(
        &self,
        handle: &LockHandle,
        execution: &TaskExecutionResult,
    ) -> Result<TaskStatus, QueueError> {
        let current = self.result.lock().clone();
        let escalated = escalate(
            &current,
            execution,
            self.env.fault_error_threshold,
            self.env.time.now(),
        )?;
        let status = escalated.result.status;

        self.env.result_queue.post(escalated.result.clone()).await?;
        *self.result.lock() = escalated.result;

        if escalated.should_retry {
            handle
                .client()
                .execute(
                    self.env.statements.requeue.as_str(),
                    &[&status.as_i16(), &execution.retry_at_ticks, &self.task.id],
                )
                .await?;
        } else {
            handle
                .client()
                .execute(self.env.statements.delete.as_str(), &[&self.task.id])
                .await?;
        }
        Ok(status)
    }
}

impl Drop for TokenShared {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
        if !self.released.load(Ordering::Acquire) {
            debug!(task_id = %self.task.id, "Token dropped without release; closing its session");
            self.fire_released();
        }
    }
}

/// Exclusive lease on a dequeued task. Clones share the same lease.
#[derive(Clone)]
pub struct TaskToken {
    shared: Arc<TokenShared>,
}

impl std::fmt::Debug for TaskToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskToken")
            .field("task_id", &self.shared.task.id)
            .field("task_type", &self.shared.task.task_type)
            .field("state", &self.state())
            .field("is_locked", &self.is_locked())
            .finish()
    }
}

impl TaskToken {
    pub(crate) fn new(
        task: QueuedTask,
        result: QueuedTaskResult,
        dequeued_at: AbstractTimestamp,
        handle: LockHandle,
        env: Arc<TokenEnvironment>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stats = ConnectionStats::default();
        stats.record(handle.established_in());

        Self {
            shared: Arc::new(TokenShared {
                task,
                result: Mutex::new(result),
                dequeued_at,
                state: AtomicU8::new(TokenState::Pending as u8),
                lock: tokio::sync::Mutex::new(Some(handle)),
                is_locked: AtomicBool::new(true),
                released: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                events,
                watchdog: Mutex::new(None),
                stats,
                env,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.task.id
    }

    pub fn task(&self) -> &QueuedTask {
        &self.shared.task
    }

    /// Snapshot of the task's result as this token knows it.
    pub fn result(&self) -> QueuedTaskResult {
        self.shared.result.lock().clone()
    }

    /// Logical time at which the task was dequeued.
    pub fn dequeued_at(&self) -> AbstractTimestamp {
        self.shared.dequeued_at
    }

    pub fn state(&self) -> TokenState {
        self.shared.state()
    }

    /// Whether this token still holds the advisory lock.
    pub fn is_locked(&self) -> bool {
        self.shared.is_locked.load(Ordering::Acquire)
    }

    /// Cancelled when the token loses or gives up its lock.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    /// Marks the task as started and leases it for `lease` of wall-clock
    /// time, priced in ticks at the time of dequeue.
    ///
    /// Returns `Ok(false)` when the token is not pending, or when the task
    /// row was changed underneath it, in which case the lock is released.
    pub async fn try_set_started(&self, lease: Duration) -> Result<bool, QueueError> {
        let shared = &self.shared;
        if shared.state() != TokenState::Pending || shared.cancel.is_cancelled() {
            return Ok(false);
        }

        let mut slot = shared.lock.lock().await;
        if shared.state() != TokenState::Pending || shared.cancel.is_cancelled() {
            return Ok(false);
        }
        let Some(handle) = slot.as_ref() else {
            return Ok(false);
        };

        let locked_until = shared.dequeued_at.add_wallclock_duration(lease).ticks();
        let updated = handle
            .client()
            .execute(
                shared.env.statements.start.as_str(),
                &[&TaskStatus::Processing.as_i16(), &locked_until, &shared.task.id],
            )
            .await;

        match updated {
            Ok(1) => {
                shared
                    .state
                    .store(TokenState::Active as u8, Ordering::Release);
                drop(slot);
                *shared.watchdog.lock() = Some(watchdog::spawn(&self.shared));
                counter!("beltline.tokens.started").increment(1);
                debug!(task_id = %shared.task.id, locked_until, "Task started");
                Ok(true)
            }
            Ok(rows) => {
                warn!(task_id = %shared.task.id, rows, "Task row changed before start, giving up lease");
                shared.release_with(&mut slot, TokenState::Cancelled).await;
                Ok(false)
            }
            Err(e) => {
                shared.release_with(&mut slot, TokenState::Cancelled).await;
                Err(e.into())
            }
        }
    }

    /// Reports the outcome of the execution and releases the lock.
    ///
    /// The result row is written before the task row is requeued or
    /// deleted, so a failed write leaves the task in place for another
    /// attempt once its lease lapses. The lock is released whether or not
    /// the report succeeded.
    ///
    /// Returns `Ok(false)` when the token is not active.
    pub async fn try_set_result(&self, execution: TaskExecutionResult) -> Result<bool, QueueError> {
        let shared = &self.shared;
        if shared.state() != TokenState::Active {
            return Ok(false);
        }

        let mut slot = shared.lock.lock().await;
        if shared.state() != TokenState::Active {
            return Ok(false);
        }
        let recorded = match slot.as_ref() {
            Some(handle) => shared.record_result(handle, &execution).await,
            None => return Ok(false),
        };

        match recorded {
            Ok(status) => {
                shared.release_with(&mut slot, TokenState::Completed).await;
                counter!("beltline.tokens.completed", "status" => status.as_str()).increment(1);
                info!(
                    task_id = %shared.task.id,
                    task_type = %shared.task.task_type,
                    status = %status,
                    retry_at = execution.retry_at_ticks,
                    "Task result recorded"
                );
                Ok(true)
            }
            Err(e) => {
                shared.release_with(&mut slot, TokenState::Cancelled).await;
                counter!("beltline.tokens.result_failures").increment(1);
                warn!(
                    task_id = %shared.task.id,
                    error = %e,
                    "Task result not recorded; the task runs again after its lease"
                );
                Err(e)
            }
        }
    }

    /// Gives the lock up without reporting a result. Idempotent.
    pub async fn release_lock(&self) {
        let shared = &self.shared;
        let mut slot = shared.lock.lock().await;
        shared.release_with(&mut slot, TokenState::Cancelled).await;
    }
}
