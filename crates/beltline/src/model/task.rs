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

//! Pending task rows.
//!
//! A [`QueuedTask`] lives in the tasks table from the moment it is posted
//! until its result reaches a terminal status. Every other change to it goes
//! through the dequeue routine or the owning [`TaskToken`](crate::token::TaskToken).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

use super::status::TaskStatus;
use crate::error::QueueError;

/// A task waiting in, or currently leased from, the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Unique task identifier
    pub id: Uuid,
    /// Advisory-lock key, assigned from a sequence when the task is posted
    pub lock_handle_id: i64,
    /// Type tag used to route the payload to a handler
    pub task_type: String,
    /// Free-form description of who posted the task
    pub source: String,
    /// Serialized task payload
    pub payload: serde_json::Value,
    /// Higher values are dequeued first
    pub priority: i32,
    /// Logical tick at which the task was posted
    pub posted_at: i64,
    /// Wall-clock time at which the task was posted
    pub posted_at_ts: DateTime<Utc>,
    /// Logical tick before which the task may not be dequeued
    pub locked_until: i64,
    pub status: TaskStatus,
}

impl QueuedTask {
    pub(crate) fn from_row(row: &Row) -> Result<Self, QueueError> {
        Ok(Self {
            id: row.try_get("id")?,
            lock_handle_id: row.try_get("lock_handle_id")?,
            task_type: row.try_get("task_type")?,
            source: row.try_get("source")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            posted_at: row.try_get("posted_at")?,
            posted_at_ts: row.try_get("posted_at_ts")?,
            locked_until: row.try_get("locked_until")?,
            status: TaskStatus::from_i16(row.try_get("status")?)?,
        })
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A task about to be posted by a [`QueueProducer`](crate::producer::QueueProducer).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Wall-clock delay before the task becomes eligible, converted to ticks
    /// at post time.
    pub delay: Option<Duration>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            source: String::from("beltline"),
            payload,
            priority: 0,
            delay: None,
        }
    }

    /// Serializes `payload` and uses it as the task payload.
    pub fn from_payload<T: Serialize>(
        task_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(task_type, serde_json::to_value(payload)?))
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.priority < 0 {
            return Err(QueueError::InvalidTask(format!(
                "priority must be non-negative, got {}",
                self.priority
            )));
        }
        if self.source.trim().is_empty() {
            return Err(QueueError::InvalidTask("source must not be empty".into()));
        }
        if self.task_type.trim().is_empty() {
            return Err(QueueError::InvalidTask("task type must not be empty".into()));
        }
        Ok(())
    }
}
