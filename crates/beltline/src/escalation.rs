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

//! The escalation ladder.
//!
//! Results only move forward: a failing task climbs from `Error` to
//! `Faulted` when its error count reaches the fault threshold and to `Fatal`
//! once it passes it. A non-recoverable failure jumps straight to `Fatal`.
//! Applying another execution to a terminal result is a caller bug and is
//! rejected with [`EscalationError::AlreadyFinalized`].
//!
//! The retry delay for a failed task is chosen by a [`RetryPolicy`]; the
//! ladder itself only decides whether a retry is allowed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ExecutionOutcome, QueuedTaskResult, TaskExecutionResult, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscalationError {
    #[error("Result of task {task_id} is already finalized as {status}")]
    AlreadyFinalized { task_id: Uuid, status: TaskStatus },
}

/// The result after an execution was applied, and whether the task goes
/// back into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationResult {
    pub result: QueuedTaskResult,
    pub should_retry: bool,
}

/// Applies one execution report to `current`.
pub fn escalate(
    current: &QueuedTaskResult,
    execution: &TaskExecutionResult,
    fault_threshold: i32,
    now: DateTime<Utc>,
) -> Result<EscalationResult, EscalationError> {
    if current.status.is_terminal() {
        return Err(EscalationError::AlreadyFinalized {
            task_id: current.id,
            status: current.status,
        });
    }

    let mut result = current.clone();
    result.processing_time_ms = execution.processing_time_ms;
    result.last_processing_attempted_at_ts = Some(now);
    if result.first_processing_attempted_at_ts.is_none() {
        result.first_processing_attempted_at_ts = Some(now);
    }

    match &execution.outcome {
        ExecutionOutcome::Succeeded => {
            result.status = TaskStatus::Processed;
            result.last_error = None;
            result.last_error_is_recoverable = false;
        }
        ExecutionOutcome::Cancelled => {
            result.status = TaskStatus::Cancelled;
        }
        ExecutionOutcome::Failed { error, recoverable } => {
            result.error_count = result.error_count.saturating_add(1);
            result.last_error = Some(error.clone());
            result.last_error_is_recoverable = *recoverable;
            result.status = status_for_failure(result.error_count, *recoverable, fault_threshold);
        }
    }

    if result.status.is_terminal() {
        result.processing_finalized_at_ts = Some(now);
    }

    let should_retry = !result.status.is_terminal();
    Ok(EscalationResult {
        result,
        should_retry,
    })
}

fn status_for_failure(error_count: i32, recoverable: bool, fault_threshold: i32) -> TaskStatus {
    if !recoverable || error_count > fault_threshold {
        TaskStatus::Fatal
    } else if error_count == fault_threshold {
        TaskStatus::Faulted
    } else {
        TaskStatus::Error
    }
}

/// Chooses how long a failed task waits before it may be dequeued again.
pub trait RetryPolicy: Send + Sync {
    /// `error_count` is the number of failures including the one just seen.
    fn retry_delay(&self, error_count: i32) -> Duration;
}

/// Delay of `base_ms * 10^error_count`, capped at `max_delay`.
///
/// With the default base of 10 ms the first retry waits 100 ms, the second
/// one second, and so on.
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    base_ms: u64,
    max_delay: Duration,
}

impl ExponentialRetryPolicy {
    pub fn new(base_ms: u64, max_delay: Duration) -> Self {
        Self { base_ms, max_delay }
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60 * 60))
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn retry_delay(&self, error_count: i32) -> Duration {
        let exponent = u32::try_from(error_count.max(0)).unwrap_or(0);
        let delay_ms = 10_u64
            .checked_pow(exponent)
            .and_then(|factor| factor.checked_mul(self.base_ms))
            .map(Duration::from_millis)
            .unwrap_or(self.max_delay);
        delay_ms.min(self.max_delay)
    }
}
