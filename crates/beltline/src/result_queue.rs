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

//! Batched write-back of task results.
//!
//! Tokens hand their final result rows to the [`TaskResultQueue`], which
//! writes up to `result_batch_size` of them per transaction. Results still
//! queued when the queue is stopped are written before `stop` returns.

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::batch::{
    BatchHandler, BatchProcessorOptions, BatchRequestProcessor, Request, RequestOptions,
};
use crate::config::QueueConfig;
use crate::database::Database;
use crate::error::QueueError;
use crate::model::{QueuedTaskResult, TaskStatus};

const EVENT_CAPACITY: usize = 256;

const UPSERT_RESULT: &str = "INSERT INTO {results} AS r (
        id, task_type, source, payload, priority, status, last_error, error_count,
        last_error_is_recoverable, processing_time_ms, posted_at_ts,
        first_processing_attempted_at_ts, last_processing_attempted_at_ts,
        processing_finalized_at_ts
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
    ON CONFLICT (id) DO UPDATE SET
        status = EXCLUDED.status,
        last_error = EXCLUDED.last_error,
        error_count = EXCLUDED.error_count,
        last_error_is_recoverable = EXCLUDED.last_error_is_recoverable,
        processing_time_ms = EXCLUDED.processing_time_ms,
        first_processing_attempted_at_ts = COALESCE(r.first_processing_attempted_at_ts, EXCLUDED.first_processing_attempted_at_ts),
        last_processing_attempted_at_ts = EXCLUDED.last_processing_attempted_at_ts,
        processing_finalized_at_ts = EXCLUDED.processing_finalized_at_ts";

/// Emitted once per result row written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResultProcessed {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

pub(crate) struct ResultWriter {
    db: Database,
    upsert_sql: String,
    events: broadcast::Sender<TaskResultProcessed>,
}

#[async_trait]
impl BatchHandler for ResultWriter {
    type Request = QueuedTaskResult;
    type Output = ();

    async fn process_batch(&self, batch: &[Request<Self>]) -> Result<(), QueueError> {
        let mut client = self.db.get_client().await?;
        let tx = client.transaction().await?;
        let statement = tx.prepare(self.upsert_sql.as_str()).await?;

        for request in batch {
            let result = request.payload();
            let last_error = result.last_error_json()?;
            tx.execute(
                &statement,
                &[
                    &result.id,
                    &result.task_type,
                    &result.source,
                    &result.payload,
                    &result.priority,
                    &result.status.as_i16(),
                    &last_error,
                    &result.error_count,
                    &result.last_error_is_recoverable,
                    &result.processing_time_ms,
                    &result.posted_at_ts,
                    &result.first_processing_attempted_at_ts,
                    &result.last_processing_attempted_at_ts,
                    &result.processing_finalized_at_ts,
                ],
            )
            .await?;
        }
        tx.commit().await?;

        for request in batch {
            let result = request.payload();
            request.set_completed(());
            let _ = self.events.send(TaskResultProcessed {
                task_id: result.id,
                status: result.status,
            });
        }
        counter!("beltline.results.written").increment(batch.len() as u64);
        debug!(count = batch.len(), "Task results written");
        Ok(())
    }
}

/// Writes result rows in batches.
pub struct TaskResultQueue {
    processor: BatchRequestProcessor<ResultWriter>,
    events: broadcast::Sender<TaskResultProcessed>,
}

impl std::fmt::Debug for TaskResultQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResultQueue")
            .field("running", &self.processor.is_running())
            .finish()
    }
}

impl TaskResultQueue {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let writer = ResultWriter {
            upsert_sql: db.mapping().render(UPSERT_RESULT),
            db,
            events: events.clone(),
        };
        let processor = BatchRequestProcessor::new(
            "TaskResultQueue",
            writer,
            BatchProcessorOptions {
                batch_size: config.result_batch_size(),
                request_options: RequestOptions {
                    timeout: None,
                    max_fail_count: config.result_max_fail_count(),
                },
                process_remaining_on_stop: true,
            },
        );
        Self { processor, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskResultProcessed> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub async fn start(&self) -> Result<bool, QueueError> {
        let started = self.processor.start().await?;
        if started {
            info!("Task result queue started");
        }
        Ok(started)
    }

    /// Stops the queue after writing everything still queued.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        let stopped = self.processor.stop().await?;
        if stopped {
            info!("Task result queue stopped");
        }
        Ok(stopped)
    }

    /// Queues `result` for writing and waits until it has been written.
    pub async fn post(&self, result: QueuedTaskResult) -> Result<(), QueueError> {
        self.processor.submit(result).await
    }
}
