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

//! One process's share of a queue, wired together.
//!
//! [`QueueRunner`] owns the components a worker process needs and starts
//! and stops them in dependency order:
//!
//! 1. schema migrations
//! 2. result write-back queue
//! 3. timing belt
//! 4. consumer (and its listener)
//! 5. worker pool and poller
//!
//! Stopping runs the same list backwards. The poller stops first so no new
//! leases are taken; workers finish what is buffered; results still queued
//! are written before the result queue stops.
//!
//! # Example
//!
//! ```rust,ignore
//! use beltline::{HandlerRegistry, NewTask, QueueConfig, QueueRunner};
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("send_email", SendEmail);
//!
//! let runner = QueueRunner::new(QueueConfig::from_env()?, handlers)?;
//! runner.start().await?;
//! runner.producer().enqueue(NewTask::new("send_email", payload)).await?;
//! // ...
//! runner.stop().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::buffer::TaskBuffer;
use crate::config::QueueConfig;
use crate::consumer::QueueConsumer;
use crate::database::{run_migrations, Database};
use crate::error::QueueError;
use crate::escalation::{ExponentialRetryPolicy, RetryPolicy};
use crate::model::TaskExecutionStats;
use crate::poller::TaskPoller;
use crate::producer::QueueProducer;
use crate::queue_info::QueueInfo;
use crate::result_queue::TaskResultQueue;
use crate::state_controller::StateController;
use crate::timing_belt::TimingBelt;
use crate::token::TaskToken;
use crate::worker::{HandlerRegistry, WorkerContext, WorkerPool};

struct Running {
    buffer: Arc<TaskBuffer<TaskToken>>,
    poller: TaskPoller,
    workers: WorkerPool,
}

pub struct QueueRunner {
    config: QueueConfig,
    db: Database,
    registry: Arc<HandlerRegistry>,
    retry_policy: Arc<dyn RetryPolicy>,
    belt: Arc<TimingBelt>,
    result_queue: Arc<TaskResultQueue>,
    consumer: Arc<QueueConsumer>,
    stats: Arc<Mutex<TaskExecutionStats>>,
    controller: StateController,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl std::fmt::Debug for QueueRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRunner")
            .field("prefix", &self.config.mapping().prefix())
            .field("state", &self.controller.state())
            .field("handlers", &self.registry)
            .finish()
    }
}

impl QueueRunner {
    pub fn new(config: QueueConfig, registry: HandlerRegistry) -> Result<Self, QueueError> {
        let db = Database::new(&config)?;
        let result_queue = Arc::new(TaskResultQueue::new(db.clone(), &config));

        Ok(Self {
            belt: Arc::new(TimingBelt::new(db.clone(), &config)),
            consumer: Arc::new(QueueConsumer::new(
                db.clone(),
                &config,
                result_queue.clone(),
            )),
            result_queue,
            registry: Arc::new(registry),
            retry_policy: Arc::new(ExponentialRetryPolicy::default()),
            stats: Arc::new(Mutex::new(TaskExecutionStats::default())),
            controller: StateController::new(),
            running: tokio::sync::Mutex::new(None),
            db,
            config,
        })
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn timing_belt(&self) -> &Arc<TimingBelt> {
        &self.belt
    }

    pub fn consumer(&self) -> &Arc<QueueConsumer> {
        &self.consumer
    }

    pub fn producer(&self) -> QueueProducer {
        QueueProducer::new(self.db.clone(), &self.config)
    }

    pub fn queue_info(&self) -> QueueInfo {
        QueueInfo::new(self.db.clone(), &self.config)
    }

    /// Timing figures of every execution run by this runner.
    pub fn execution_stats(&self) -> TaskExecutionStats {
        *self.stats.lock()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_started()
    }

    pub async fn start(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_start(|| async {
                // An empty type filter would lease every task type.
                if self.registry.is_empty() {
                    return Err(QueueError::Configuration {
                        message: "a queue runner needs at least one task handler".to_string(),
                    });
                }

                run_migrations(&self.db).await?;
                self.result_queue.start().await?;
                self.belt.start().await?;
                if let Err(e) = self.consumer.start().await {
                    self.belt.stop().await?;
                    self.result_queue.stop().await?;
                    return Err(e);
                }

                let buffer = Arc::new(TaskBuffer::new(self.config.buffer_capacity()));
                let workers = WorkerPool::spawn(
                    self.config.worker_count(),
                    Arc::new(WorkerContext {
                        buffer: buffer.clone(),
                        registry: self.registry.clone(),
                        belt: self.belt.clone(),
                        retry_policy: self.retry_policy.clone(),
                        lease_duration: self.config.lease_duration(),
                        stats: self.stats.clone(),
                    }),
                );
                let poller = TaskPoller::new(
                    self.consumer.clone(),
                    self.belt.clone(),
                    buffer.clone(),
                    self.registry.task_types(),
                    self.config.poll_fallback_interval(),
                );
                poller.start().await?;

                *self.running.lock().await = Some(Running {
                    buffer,
                    poller,
                    workers,
                });
                info!(
                    prefix = self.config.mapping().prefix(),
                    workers = self.config.worker_count(),
                    task_types = ?self.registry.task_types(),
                    "Queue runner started"
                );
                Ok(())
            })
            .await
    }

    /// Stops taking new work, lets the workers finish what they hold and
    /// flushes pending results.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_stop(|| async {
                if let Some(running) = self.running.lock().await.take() {
                    running.poller.stop().await?;
                    running.buffer.complete_adding();
                    running.workers.join().await;
                }

                self.consumer.stop().await?;
                self.belt.stop().await?;
                self.result_queue.stop().await?;
                info!(prefix = self.config.mapping().prefix(), "Queue runner stopped");
                Ok(())
            })
            .await
    }
}
