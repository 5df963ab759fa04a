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

//! Posting tasks.
//!
//! A task, its initial result row and the notification announcing it are
//! written in one transaction. PostgreSQL delivers `NOTIFY` on commit, so
//! listeners never hear about a task they cannot see yet.

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::database::Database;
use crate::error::QueueError;
use crate::model::timestamp::duration_to_ms;
use crate::model::{AbstractTimestamp, NewTask, QueuedTask, TaskStatus};

const INSERT_TASK: &str = "INSERT INTO {tasks}
        (id, task_type, source, payload, priority, posted_at, posted_at_ts, locked_until, status)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    RETURNING *";

const INSERT_RESULT: &str = "INSERT INTO {results}
        (id, task_type, source, payload, priority, status, posted_at_ts)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO NOTHING";

const CURRENT_TIME: &str =
    "SELECT total_ticks, total_ticks_cost FROM {time} WHERE time_id = $1";

/// Body of the notification sent for each posted task.
#[derive(Debug, Serialize)]
struct PostedNotification<'a> {
    id: Uuid,
    task_type: &'a str,
    priority: i32,
}

/// Posts tasks to one queue.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    db: Database,
    time_id: Uuid,
    channel: String,
    insert_task_sql: String,
    insert_result_sql: String,
    current_time_sql: String,
}

impl QueueProducer {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        let mapping = db.mapping().clone();
        Self {
            time_id: config.time_id(),
            channel: mapping.notification_channel(),
            insert_task_sql: mapping.render(INSERT_TASK),
            insert_result_sql: mapping.render(INSERT_RESULT),
            current_time_sql: mapping.render(CURRENT_TIME),
            db,
        }
    }

    /// Posts `task` and announces it to listeners.
    ///
    /// The task is stamped with the current logical time. A delay is
    /// converted to ticks at the current tick duration.
    pub async fn enqueue(&self, task: NewTask) -> Result<QueuedTask, QueueError> {
        task.validate()?;

        let mut client = self.db.get_client().await?;
        let tx = client.transaction().await?;

        let now = match tx
            .query_opt(self.current_time_sql.as_str(), &[&self.time_id])
            .await?
        {
            Some(row) => AbstractTimestamp::new(row.try_get(0)?, row.try_get(1)?),
            None => AbstractTimestamp::ZERO,
        };
        let locked_until = locked_until_for(&now, &task);

        let id = Uuid::new_v4();
        let posted_at_ts = Utc::now();
        let row = tx
            .query_one(
                self.insert_task_sql.as_str(),
                &[
                    &id,
                    &task.task_type,
                    &task.source,
                    &task.payload,
                    &task.priority,
                    &now.ticks(),
                    &posted_at_ts,
                    &locked_until,
                    &TaskStatus::Unprocessed.as_i16(),
                ],
            )
            .await?;
        let queued = QueuedTask::from_row(&row)?;

        tx.execute(
            self.insert_result_sql.as_str(),
            &[
                &id,
                &task.task_type,
                &task.source,
                &task.payload,
                &task.priority,
                &TaskStatus::Unprocessed.as_i16(),
                &posted_at_ts,
            ],
        )
        .await?;

        let notification = serde_json::to_string(&PostedNotification {
            id,
            task_type: &queued.task_type,
            priority: queued.priority,
        })?;
        tx.execute("SELECT pg_notify($1, $2)", &[&self.channel, &notification])
            .await?;

        tx.commit().await?;

        counter!("beltline.tasks.posted", "task_type" => queued.task_type.clone()).increment(1);
        debug!(
            task_id = %queued.id,
            task_type = %queued.task_type,
            posted_at = queued.posted_at,
            locked_until = queued.locked_until,
            "Task posted"
        );
        Ok(queued)
    }
}

fn locked_until_for(now: &AbstractTimestamp, task: &NewTask) -> i64 {
    match task.delay {
        Some(delay) => now
            .ticks()
            .saturating_add(now.ticks_for_wallclock_duration(duration_to_ms(delay))),
        None => now.ticks(),
    }
}
