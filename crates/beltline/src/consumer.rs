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

//! Dequeue protocol and lease bookkeeping.
//!
//! Every successful [`QueueConsumer::dequeue`] runs on its own dedicated
//! connection. The stored dequeue function walks eligible tasks in priority
//! order and takes a session-level advisory lock on the first one it can;
//! from then on the lock, and with it the right to work on the task, lives
//! exactly as long as that connection. The connection is handed to the
//! returned [`TaskToken`]. Attempts that find nothing keep their session
//! in a small idle cache so empty polls do not open new backends.
//!
//! The consumer also turns listener events into
//! [`ConsumerEvent::ClearForDequeue`] signals, and announces released leases,
//! so pollers know when another dequeue attempt is worthwhile.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::database::{Database, DedicatedConnection};
use crate::error::QueueError;
use crate::listener::{ListenerEvent, NotificationListener};
use crate::model::{AbstractTimestamp, QueuedTask, QueuedTaskResult, TaskStatus};
use crate::result_queue::TaskResultQueue;
use crate::state_controller::StateController;
use crate::time_provider::{TimeProvider, UtcTimeProvider};
use crate::token::{LockHandle, TaskToken, TokenEnvironment, TokenStatements};

const EVENT_CAPACITY: usize = 256;
const MAX_IDLE_CONNECTIONS: usize = 2;

/// Why a dequeue attempt may now succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearForDequeueReason {
    ListenerConnected,
    NewTaskPostedNotificationReceived,
    ListenerConnectionRestored,
    ListenerTimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    ClearForDequeue { reason: ClearForDequeueReason },
    /// A lease handed out by this consumer ended.
    TokenReleased { task_id: Uuid },
}

impl From<&ListenerEvent> for ClearForDequeueReason {
    fn from(event: &ListenerEvent) -> Self {
        match event {
            ListenerEvent::Connected { .. } => ClearForDequeueReason::ListenerConnected,
            ListenerEvent::ConnectionRestored { .. } => {
                ClearForDequeueReason::ListenerConnectionRestored
            }
            ListenerEvent::NewTaskPosted { .. } => {
                ClearForDequeueReason::NewTaskPostedNotificationReceived
            }
            ListenerEvent::TimedOutWhileWaiting => ClearForDequeueReason::ListenerTimedOut,
        }
    }
}

/// Live leases of one consumer.
///
/// A slot is reserved before the store is touched so concurrent dequeues
/// cannot overshoot the lease limit.
#[derive(Debug)]
pub(crate) struct LeaseRegistry {
    max_leases: usize,
    inner: Mutex<Leases>,
    events: broadcast::Sender<ConsumerEvent>,
}

#[derive(Debug, Default)]
struct Leases {
    live: HashSet<Uuid>,
    reserved: usize,
}

impl LeaseRegistry {
    pub(crate) fn new(max_leases: usize, events: broadcast::Sender<ConsumerEvent>) -> Self {
        Self {
            max_leases,
            inner: Mutex::new(Leases::default()),
            events,
        }
    }

    /// Reserves a lease slot, returning the ids currently leased.
    fn try_reserve(&self) -> Option<Vec<Uuid>> {
        let mut leases = self.inner.lock();
        if leases.live.len() + leases.reserved >= self.max_leases {
            return None;
        }
        leases.reserved += 1;
        Some(leases.live.iter().copied().collect())
    }

    fn cancel_reservation(&self) {
        let mut leases = self.inner.lock();
        leases.reserved = leases.reserved.saturating_sub(1);
    }

    fn confirm(&self, task_id: Uuid) {
        let mut leases = self.inner.lock();
        leases.reserved = leases.reserved.saturating_sub(1);
        leases.live.insert(task_id);
    }

    pub(crate) fn release(&self, task_id: Uuid) {
        let removed = self.inner.lock().live.remove(&task_id);
        if removed {
            let _ = self.events.send(ConsumerEvent::TokenReleased { task_id });
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    fn is_leased(&self, task_id: &Uuid) -> bool {
        self.inner.lock().live.contains(task_id)
    }
}

struct Forwarder {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Leases tasks from the queue.
pub struct QueueConsumer {
    db: Database,
    listener: NotificationListener,
    registry: Arc<LeaseRegistry>,
    env: Arc<TokenEnvironment>,
    events: broadcast::Sender<ConsumerEvent>,
    dequeue_statuses: Vec<i16>,
    dequeue_sql: String,
    result_sql: String,
    controller: StateController,
    forwarder: Mutex<Option<Forwarder>>,
    /// Sessions holding no lock, reused by the next dequeue.
    idle: Mutex<Vec<DedicatedConnection>>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("state", &self.controller.state())
            .field("live_leases", &self.live_lease_count())
            .field("max_leases", &self.registry.max_leases)
            .finish()
    }
}

impl QueueConsumer {
    pub fn new(db: Database, config: &QueueConfig, result_queue: Arc<TaskResultQueue>) -> Self {
        Self::with_time_provider(db, config, result_queue, Arc::new(UtcTimeProvider))
    }

    pub fn with_time_provider(
        db: Database,
        config: &QueueConfig,
        result_queue: Arc<TaskResultQueue>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(LeaseRegistry::new(
            config.max_concurrent_leases(),
            events.clone(),
        ));
        let mapping = db.mapping();

        let env = Arc::new(TokenEnvironment {
            db: db.clone(),
            result_queue,
            registry: registry.clone(),
            time,
            fault_error_threshold: config.fault_error_threshold(),
            statements: TokenStatements::new(mapping),
        });

        Self {
            listener: NotificationListener::new(db.clone(), config),
            dequeue_statuses: config
                .dequeue_statuses()
                .iter()
                .map(|status| status.as_i16())
                .collect(),
            dequeue_sql: mapping.render("SELECT * FROM {dequeue_fn}($1, $2, $3, $4)"),
            result_sql: mapping.render("SELECT * FROM {results} WHERE id = $1"),
            db,
            registry,
            env,
            events,
            controller: StateController::new(),
            forwarder: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    pub fn listener(&self) -> &NotificationListener {
        &self.listener
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_started()
    }

    /// Number of tokens handed out and not yet released.
    pub fn live_lease_count(&self) -> usize {
        self.registry.live_count()
    }

    pub fn is_leased(&self, task_id: &Uuid) -> bool {
        self.registry.is_leased(task_id)
    }

    /// Sessions kept open between dequeue attempts.
    pub fn idle_connection_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Starts listening for posted tasks and forwarding listener events.
    pub async fn start(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_start(|| async {
                let listener_events = self.listener.subscribe();
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(forward_listener_events(
                    listener_events,
                    self.events.clone(),
                    cancel.clone(),
                ));

                if let Err(e) = self.listener.start().await {
                    cancel.cancel();
                    let _ = handle.await;
                    return Err(e);
                }

                *self.forwarder.lock() = Some(Forwarder { handle, cancel });
                info!(channel = %self.listener.channel(), "Queue consumer started");
                Ok(())
            })
            .await
    }

    /// Stops listening. Tokens already handed out stay valid.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_stop(|| async {
                self.listener.stop().await?;
                let forwarder = self.forwarder.lock().take();
                if let Some(forwarder) = forwarder {
                    forwarder.cancel.cancel();
                    let _ = forwarder.handle.await;
                }
                info!(live_leases = self.live_lease_count(), "Queue consumer stopped");
                Ok(())
            })
            .await
    }

    /// Tries to lease the next eligible task at logical time `now`.
    ///
    /// An empty `accepted_types` accepts every task type. Returns `Ok(None)`
    /// when nothing is eligible, or when this consumer already holds its
    /// maximum number of leases.
    ///
    /// Dequeueing does not depend on the listener and works while the
    /// consumer is stopped.
    pub async fn dequeue(
        &self,
        now: AbstractTimestamp,
        accepted_types: &[String],
    ) -> Result<Option<TaskToken>, QueueError> {
        let Some(excluded) = self.registry.try_reserve() else {
            debug!(live_leases = self.live_lease_count(), "Lease limit reached, skipping dequeue");
            return Ok(None);
        };

        match self.lease_next(now, accepted_types, excluded).await {
            Ok(Some(token)) => {
                self.registry.confirm(token.id());
                counter!("beltline.tasks.dequeued").increment(1);
                debug!(
                    task_id = %token.id(),
                    task_type = %token.task().task_type,
                    now = %now,
                    "Task dequeued"
                );
                Ok(Some(token))
            }
            Ok(None) => {
                self.registry.cancel_reservation();
                Ok(None)
            }
            Err(e) => {
                self.registry.cancel_reservation();
                counter!("beltline.tasks.dequeue_failures").increment(1);
                Err(e)
            }
        }
    }

    async fn lease_next(
        &self,
        now: AbstractTimestamp,
        accepted_types: &[String],
        excluded: Vec<Uuid>,
    ) -> Result<Option<TaskToken>, QueueError> {
        let connection = self.checkout_connection().await?;

        match self
            .try_dequeue_on(&connection, now, accepted_types, &excluded)
            .await
        {
            Ok(Some((task, result))) => {
                let key = task.lock_handle_id;
                Ok(Some(TaskToken::new(
                    task,
                    result,
                    now,
                    LockHandle::new(connection, key),
                    self.env.clone(),
                )))
            }
            Ok(None) => {
                if release_all(&connection).await {
                    self.park_connection(connection);
                }
                Ok(None)
            }
            Err(e) => {
                release_all(&connection).await;
                Err(e)
            }
        }
    }

    async fn checkout_connection(&self) -> Result<DedicatedConnection, QueueError> {
        loop {
            let cached = self.idle.lock().pop();
            match cached {
                Some(connection) if !connection.is_closed() => return Ok(connection),
                Some(_) => continue,
                None => return self.db.connect_dedicated().await,
            }
        }
    }

    fn park_connection(&self, connection: DedicatedConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS && !connection.is_closed() {
            idle.push(connection);
        }
    }

    async fn try_dequeue_on(
        &self,
        connection: &DedicatedConnection,
        now: AbstractTimestamp,
        accepted_types: &[String],
        excluded: &[Uuid],
    ) -> Result<Option<(QueuedTask, QueuedTaskResult)>, QueueError> {
        let client = connection.client();
        let types: Vec<String> = accepted_types.to_vec();

        let Some(row) = client
            .query_opt(
                self.dequeue_sql.as_str(),
                &[&self.dequeue_statuses, &types, &excluded, &now.ticks()],
            )
            .await?
        else {
            return Ok(None);
        };
        let task = QueuedTask::from_row(&row)?;

        let result = match client
            .query_opt(self.result_sql.as_str(), &[&task.id])
            .await?
        {
            Some(row) => QueuedTaskResult::from_row(&row)?,
            None => {
                let mut result = QueuedTaskResult::for_task(&task);
                result.status = TaskStatus::Processing;
                result
            }
        };

        Ok(Some((task, result)))
    }
}

/// Drops any advisory lock a failed dequeue may have left on the session.
/// Returns whether the session is clean enough to reuse.
async fn release_all(connection: &DedicatedConnection) -> bool {
    match connection
        .client()
        .batch_execute("SELECT pg_advisory_unlock_all()")
        .await
    {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "pg_advisory_unlock_all failed; dropping the session");
            false
        }
    }
}

async fn forward_listener_events(
    mut listener_events: broadcast::Receiver<ListenerEvent>,
    events: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = listener_events.recv() => received,
        };

        match received {
            Ok(event) => {
                let reason = ClearForDequeueReason::from(&event);
                let _ = events.send(ConsumerEvent::ClearForDequeue { reason });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Consumer fell behind listener events");
                let _ = events.send(ConsumerEvent::ClearForDequeue {
                    reason: ClearForDequeueReason::ListenerTimedOut,
                });
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
