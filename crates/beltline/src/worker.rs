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

//! Task handlers and the workers that run them.
//!
//! Handlers are registered per task type. A worker takes a token from the
//! buffer, starts it with the configured lease, runs the handler under the
//! token's cancellation, charges the elapsed time to the timing belt and
//! reports the outcome back through the token.
//!
//! # Example
//!
//! ```rust,ignore
//! struct SendEmail;
//!
//! #[async_trait]
//! impl TaskHandler for SendEmail {
//!     async fn handle(&self, task: &QueuedTask, _: &CancellationToken) -> Result<(), HandlerError> {
//!         let email: Email = task.payload_as()?;
//!         smtp::send(&email).await.map_err(|e| HandlerError::recoverable(&e))
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("send_email", SendEmail);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::TaskBuffer;
use crate::error::QueueError;
use crate::escalation::RetryPolicy;
use crate::model::timestamp::duration_to_ms;
use crate::model::{QueuedTask, QueuedTaskError, TaskExecutionResult, TaskExecutionStats};
use crate::timing_belt::TimingBelt;
use crate::token::TaskToken;

/// Failure reported by a [`TaskHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The task is retried according to the escalation ladder.
    #[error("{}: {}", .0.error_type, .0.message)]
    Recoverable(QueuedTaskError),
    /// The task goes straight to `Fatal`.
    #[error("{}: {}", .0.error_type, .0.message)]
    Fatal(QueuedTaskError),
}

impl HandlerError {
    pub fn recoverable<E: std::error::Error>(error: &E) -> Self {
        HandlerError::Recoverable(QueuedTaskError::from_error(error))
    }

    pub fn fatal<E: std::error::Error>(error: &E) -> Self {
        HandlerError::Fatal(QueuedTaskError::from_error(error))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, HandlerError::Recoverable(_))
    }

    pub fn into_parts(self) -> (QueuedTaskError, bool) {
        match self {
            HandlerError::Recoverable(error) => (error, true),
            HandlerError::Fatal(error) => (error, false),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    /// A payload that does not deserialize will not deserialize next time
    /// either.
    fn from(error: serde_json::Error) -> Self {
        HandlerError::fatal(&error)
    }
}

impl From<QueueError> for HandlerError {
    fn from(error: QueueError) -> Self {
        HandlerError::recoverable(&error)
    }
}

/// Executes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Runs `task`. Long-running handlers should stop early once
    /// `cancellation` fires: the lease is gone at that point.
    async fn handle(
        &self,
        task: &QueuedTask,
        cancellation: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Handlers by task type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`, replacing any previous one.
    pub fn register<H: TaskHandler>(&mut self, task_type: impl Into<String>, handler: H) -> &mut Self {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted. Used as the dequeue type filter.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Shared by all workers of a pool.
pub(crate) struct WorkerContext {
    pub(crate) buffer: Arc<TaskBuffer<TaskToken>>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) belt: Arc<TimingBelt>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) lease_duration: Duration,
    pub(crate) stats: Arc<Mutex<TaskExecutionStats>>,
}

/// A fixed set of workers draining one buffer.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn spawn(worker_count: usize, context: Arc<WorkerContext>) -> Self {
        let workers = (0..worker_count.max(1))
            .map(|worker_id| tokio::spawn(run_worker(worker_id, context.clone())))
            .collect();
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to exit. Workers exit once the buffer is
    /// completed and drained.
    pub async fn join(self) {
        for (worker_id, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(worker_id, error = %e, "Worker ended abnormally");
            }
        }
    }
}

async fn run_worker(worker_id: usize, context: Arc<WorkerContext>) {
    debug!(worker_id, "Worker started");
    while let Some(token) = context.buffer.take().await {
        process(worker_id, &context, token).await;
    }
    debug!(worker_id, "Worker stopped");
}

async fn process(worker_id: usize, context: &WorkerContext, token: TaskToken) {
    let task_id = token.id();

    match token.try_set_started(context.lease_duration).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(worker_id, %task_id, "Token could not be started, skipping");
            return;
        }
        Err(e) => {
            warn!(worker_id, %task_id, error = %e, "Failed to start task");
            token.release_lock().await;
            return;
        }
    }

    let task = token.task();
    let cancellation = token.cancellation();
    let started = Instant::now();

    let outcome = match context.registry.get(&task.task_type) {
        Some(handler) => {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                outcome = handler.handle(task, &cancellation) => Some(outcome),
            }
        }
        None => Some(Err(HandlerError::Fatal(QueuedTaskError::new(
            "UnknownTaskType",
            format!("no handler registered for task type '{}'", task.task_type),
        )))),
    };
    let elapsed = started.elapsed();

    context.stats.lock().record(elapsed);
    context.belt.add_wallclock_cost(elapsed);

    let Some(outcome) = outcome else {
        // The token lost its lock mid-run and has already been released.
        warn!(worker_id, %task_id, "Task lease lost while running");
        return;
    };

    let execution = match outcome {
        Ok(()) => TaskExecutionResult::succeeded(elapsed),
        Err(failure) => {
            counter!("beltline.tasks.failed", "task_type" => task.task_type.clone()).increment(1);
            let error_count = token.result().error_count.saturating_add(1);
            let retry_at_ticks = retry_at(context, error_count).await;
            let (error, recoverable) = failure.into_parts();
            debug!(
                worker_id,
                %task_id,
                error_count,
                recoverable,
                retry_at_ticks,
                error = %error.message,
                "Task failed"
            );
            TaskExecutionResult::failed(error, recoverable, elapsed, retry_at_ticks)
        }
    };

    match token.try_set_result(execution).await {
        Ok(true) => {}
        Ok(false) => debug!(worker_id, %task_id, "Result not recorded, token no longer active"),
        // The token has already given up its lock.
        Err(e) => error!(worker_id, %task_id, error = %e, "Failed to record task result"),
    }
}

/// Absolute tick before which a task failed `error_count` times may not run
/// again.
async fn retry_at(context: &WorkerContext, error_count: i32) -> i64 {
    let delay = context.retry_policy.retry_delay(error_count);
    match context.belt.compute_ticks_after(delay).await {
        Ok(ticks) => ticks,
        Err(e) => {
            let last = context.belt.last_known_time();
            warn!(error = %e, "Falling back to the last known time for the retry tick");
            last.ticks()
                .saturating_add(last.ticks_for_wallclock_duration(duration_to_ms(delay)))
        }
    }
}
