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

//! Read-only views of a queue.

use serde::Serialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::database::Database;
use crate::error::QueueError;
use crate::model::{QueuedTask, QueuedTaskResult, TaskStatus};

/// Number of results per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub unprocessed: i64,
    pub processing: i64,
    pub processed: i64,
    pub error: i64,
    pub faulted: i64,
    pub fatal: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueMetrics {
    pub fn count(&self, status: TaskStatus) -> i64 {
        match status {
            TaskStatus::Unprocessed => self.unprocessed,
            TaskStatus::Processing => self.processing,
            TaskStatus::Processed => self.processed,
            TaskStatus::Error => self.error,
            TaskStatus::Faulted => self.faulted,
            TaskStatus::Fatal => self.fatal,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    fn add(&mut self, status: TaskStatus, count: i64) {
        let slot = match status {
            TaskStatus::Unprocessed => &mut self.unprocessed,
            TaskStatus::Processing => &mut self.processing,
            TaskStatus::Processed => &mut self.processed,
            TaskStatus::Error => &mut self.error,
            TaskStatus::Faulted => &mut self.faulted,
            TaskStatus::Fatal => &mut self.fatal,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
        self.total += count;
    }
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    db: Database,
    time_id: Uuid,
    dequeue_statuses: Vec<i16>,
    metrics_sql: String,
    peek_sql: String,
    result_sql: String,
}

impl QueueInfo {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        let mapping = db.mapping().clone();
        Self {
            time_id: config.time_id(),
            dequeue_statuses: config
                .dequeue_statuses()
                .iter()
                .map(|status| status.as_i16())
                .collect(),
            metrics_sql: mapping
                .render("SELECT status, COUNT(*) FROM {results} GROUP BY status"),
            // Eligible now, and not leased by anyone.
            peek_sql: mapping.render(
                "SELECT t.*
                 FROM {tasks} t
                 WHERE t.status = ANY ($1)
                   AND t.locked_until <= COALESCE(
                       (SELECT total_ticks FROM {time} WHERE time_id = $2), 0)
                   AND NOT {has_lock_fn}(t.lock_handle_id)
                 ORDER BY t.priority DESC, t.posted_at ASC, t.lock_handle_id ASC
                 LIMIT 1",
            ),
            result_sql: mapping.render("SELECT * FROM {results} WHERE id = $1"),
            db,
        }
    }

    pub async fn compute_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let client = self.db.get_client().await?;
        let rows = client.query(self.metrics_sql.as_str(), &[]).await?;

        let mut metrics = QueueMetrics::default();
        for row in rows {
            let status = TaskStatus::from_i16(row.try_get(0)?)?;
            metrics.add(status, row.try_get(1)?);
        }
        Ok(metrics)
    }

    /// The task the next dequeue would most likely pick, without leasing it.
    pub async fn peek(&self) -> Result<Option<QueuedTask>, QueueError> {
        let client = self.db.get_client().await?;
        client
            .query_opt(
                self.peek_sql.as_str(),
                &[&self.dequeue_statuses, &self.time_id],
            )
            .await?
            .map(|row| QueuedTask::from_row(&row))
            .transpose()
    }

    pub async fn get_result(&self, task_id: Uuid) -> Result<Option<QueuedTaskResult>, QueueError> {
        let client = self.db.get_client().await?;
        client
            .query_opt(self.result_sql.as_str(), &[&task_id])
            .await?
            .map(|row| QueuedTaskResult::from_row(&row))
            .transpose()
    }
}
