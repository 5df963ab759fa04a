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

//! Data model of the queue: tasks, results, statuses and logical time.

pub mod result;
pub mod stats;
pub mod status;
pub mod task;
pub mod timestamp;

pub use result::{ExecutionOutcome, QueuedTaskError, QueuedTaskResult, TaskExecutionResult};
pub use stats::TaskExecutionStats;
pub use status::TaskStatus;
pub use task::{NewTask, QueuedTask};
pub use timestamp::AbstractTimestamp;
