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

//! Task results and execution outcomes.
//!
//! Every posted task has exactly one row in the results table. It is created
//! with the task, refreshed when the task is dequeued, and updated once per
//! reported execution through the [escalation ladder](crate::escalation).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

use super::status::TaskStatus;
use super::task::QueuedTask;
use super::timestamp::duration_to_ms;
use crate::error::QueueError;

/// Description of the last error a task failed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTaskError {
    /// Kind of error, usually the handler's error type name
    pub error_type: String,
    pub message: String,
    /// Optional backtrace or chain of causes
    pub stack_trace: Option<String>,
}

impl QueuedTaskError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Builds an error description from any error, recording its source chain.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let full_name = std::any::type_name::<E>();
        let path = full_name.split('<').next().unwrap_or(full_name);

        Self {
            error_type: path.rsplit("::").next().unwrap_or(path).to_string(),
            message: error.to_string(),
            stack_trace: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }
}

/// Persisted outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTaskResult {
    pub id: Uuid,
    pub task_type: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    /// Number of failed executions so far
    pub error_count: i32,
    pub last_error: Option<QueuedTaskError>,
    pub last_error_is_recoverable: bool,
    /// Duration of the last execution, in milliseconds
    pub processing_time_ms: i64,
    pub posted_at_ts: DateTime<Utc>,
    pub first_processing_attempted_at_ts: Option<DateTime<Utc>>,
    pub last_processing_attempted_at_ts: Option<DateTime<Utc>>,
    /// Set once the result reaches a terminal status
    pub processing_finalized_at_ts: Option<DateTime<Utc>>,
}

impl QueuedTaskResult {
    /// Initial result for a freshly posted task.
    pub fn for_task(task: &QueuedTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            source: task.source.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            status: TaskStatus::Unprocessed,
            error_count: 0,
            last_error: None,
            last_error_is_recoverable: false,
            processing_time_ms: 0,
            posted_at_ts: task.posted_at_ts,
            first_processing_attempted_at_ts: None,
            last_processing_attempted_at_ts: None,
            processing_finalized_at_ts: None,
        }
    }

    pub(crate) fn from_row(row: &Row) -> Result<Self, QueueError> {
        let last_error: Option<serde_json::Value> = row.try_get("last_error")?;
        let last_error = last_error.map(serde_json::from_value).transpose()?;

        Ok(Self {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            source: row.try_get("source")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: TaskStatus::from_i16(row.try_get("status")?)?,
            error_count: row.try_get("error_count")?,
            last_error,
            last_error_is_recoverable: row.try_get("last_error_is_recoverable")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            posted_at_ts: row.try_get("posted_at_ts")?,
            first_processing_attempted_at_ts: row.try_get("first_processing_attempted_at_ts")?,
            last_processing_attempted_at_ts: row.try_get("last_processing_attempted_at_ts")?,
            processing_finalized_at_ts: row.try_get("processing_finalized_at_ts")?,
        })
    }

    pub(crate) fn last_error_json(&self) -> Result<Option<serde_json::Value>, QueueError> {
        Ok(self
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?)
    }
}

/// What happened when a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed {
        error: QueuedTaskError,
        /// Non-recoverable errors skip the escalation ladder and go to Fatal
        recoverable: bool,
    },
    Cancelled,
}

/// An execution report handed to
/// [`TaskToken::try_set_result`](crate::token::TaskToken::try_set_result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionResult {
    pub outcome: ExecutionOutcome,
    pub processing_time_ms: i64,
    /// Absolute logical tick before which a failed task may not be retried
    pub retry_at_ticks: i64,
}

impl TaskExecutionResult {
    pub fn succeeded(processing_time: Duration) -> Self {
        Self {
            outcome: ExecutionOutcome::Succeeded,
            processing_time_ms: duration_to_ms(processing_time),
            retry_at_ticks: 0,
        }
    }

    pub fn failed(
        error: QueuedTaskError,
        recoverable: bool,
        processing_time: Duration,
        retry_at_ticks: i64,
    ) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed { error, recoverable },
            processing_time_ms: duration_to_ms(processing_time),
            retry_at_ticks,
        }
    }

    pub fn cancelled(processing_time: Duration) -> Self {
        Self {
            outcome: ExecutionOutcome::Cancelled,
            processing_time_ms: duration_to_ms(processing_time),
            retry_at_ticks: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Succeeded)
    }
}
