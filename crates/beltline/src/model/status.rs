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

//! Status shared by queued tasks and their results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Processing status of a task.
///
/// Persisted as a `smallint`; the discriminants are part of the storage
/// format and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TaskStatus {
    Unprocessed = 0,
    Processing = 1,
    Processed = 2,
    /// Failed, still below the fault threshold.
    Error = 3,
    /// Failed exactly at the fault threshold; one more dequeue is allowed.
    Faulted = 4,
    Fatal = 5,
    Cancelled = 6,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Unprocessed,
        TaskStatus::Processing,
        TaskStatus::Processed,
        TaskStatus::Error,
        TaskStatus::Faulted,
        TaskStatus::Fatal,
        TaskStatus::Cancelled,
    ];

    /// Statuses the dequeue routine considers.
    pub const DEQUEUEABLE: [TaskStatus; 3] = [
        TaskStatus::Unprocessed,
        TaskStatus::Error,
        TaskStatus::Faulted,
    ];

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self, QueueError> {
        TaskStatus::ALL
            .into_iter()
            .find(|s| s.as_i16() == value)
            .ok_or_else(|| QueueError::Storage(format!("unknown task status {}", value)))
    }

    /// Terminal statuses are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Processed | TaskStatus::Fatal | TaskStatus::Cancelled
        )
    }

    pub fn is_dequeueable(self) -> bool {
        TaskStatus::DEQUEUEABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Unprocessed => "unprocessed",
            TaskStatus::Processing => "processing",
            TaskStatus::Processed => "processed",
            TaskStatus::Error => "error",
            TaskStatus::Faulted => "faulted",
            TaskStatus::Fatal => "fatal",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_storage_values_are_stable() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_i16(status.as_i16()).unwrap(), status);
        }
        assert_eq!(TaskStatus::Unprocessed.as_i16(), 0);
        assert_eq!(TaskStatus::Cancelled.as_i16(), 6);
        assert!(TaskStatus::from_i16(42).is_err());
    }

    #[test]
    fn test_terminal_and_dequeueable_are_disjoint() {
        for status in TaskStatus::ALL {
            assert!(!(status.is_terminal() && status.is_dequeueable()));
        }
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Processing.is_dequeueable());
    }
}
