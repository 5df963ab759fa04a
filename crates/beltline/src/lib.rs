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

//! # beltline
//!
//! A persistent, multi-worker job queue on PostgreSQL.
//!
//! Producers post typed tasks; consumers lease them under session-level
//! advisory locks, run them and report the outcome. Failed tasks climb an
//! escalation ladder (`Error`, then `Faulted`, then `Fatal`) and wait out
//! their retry delay on a logical clock shared by every process attached to
//! the queue, the *timing belt*, so backoff does not depend on any one
//! machine's wall clock.
//!
//! Delivery is at least once: a lease whose holder disappears expires and
//! the task is picked up again, so handlers should be idempotent.
//!
//! ## Components
//!
//! - [`QueueProducer`] posts tasks and notifies listeners.
//! - [`NotificationListener`] follows `LISTEN`/`NOTIFY` and reconnects.
//! - [`QueueConsumer`] leases tasks as [`TaskToken`]s.
//! - [`TaskToken`] owns the lock connection, re-locks after a drop and
//!   records results.
//! - [`TimingBelt`] is the shared logical clock.
//! - [`TaskResultQueue`] writes result rows in batches.
//! - [`QueueRunner`] wires all of the above to a pool of workers running
//!   registered [`TaskHandler`]s.
//!
//! ## Example
//!
//! ```rust,ignore
//! use beltline::{HandlerRegistry, NewTask, QueueConfig, QueueRunner};
//!
//! beltline::init_logging(None);
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("resize_image", ResizeImage);
//!
//! let runner = QueueRunner::new(QueueConfig::from_env()?, handlers)?;
//! runner.start().await?;
//! runner
//!     .producer()
//!     .enqueue(NewTask::new("resize_image", serde_json::json!({ "id": 7 })))
//!     .await?;
//! ```

pub mod batch;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod database;
pub mod error;
pub mod escalation;
pub mod listener;
pub mod model;
pub mod poller;
pub mod producer;
pub mod queue_info;
pub mod result_queue;
pub mod runner;
pub mod state_controller;
pub mod time_provider;
pub mod timing_belt;
pub mod token;
pub mod worker;

pub use batch::{BatchHandler, BatchProcessorOptions, BatchRequest, BatchRequestProcessor, RequestOptions};
pub use buffer::TaskBuffer;
pub use config::{QueueConfig, QueueConfigBuilder};
pub use consumer::{ClearForDequeueReason, ConsumerEvent, QueueConsumer};
pub use database::{run_migrations, Database, QueueMapping};
pub use error::{QueueError, RequestError, Result};
pub use escalation::{escalate, EscalationError, EscalationResult, ExponentialRetryPolicy, RetryPolicy};
pub use listener::{ListenerDiagnostics, ListenerEvent, NotificationListener};
pub use model::{
    AbstractTimestamp, ExecutionOutcome, NewTask, QueuedTask, QueuedTaskError, QueuedTaskResult,
    TaskExecutionResult, TaskExecutionStats, TaskStatus,
};
pub use poller::TaskPoller;
pub use producer::QueueProducer;
pub use queue_info::{QueueInfo, QueueMetrics};
pub use result_queue::{TaskResultProcessed, TaskResultQueue};
pub use runner::QueueRunner;
pub use state_controller::{ComponentState, StateController};
pub use time_provider::{FixedTimeProvider, TimeProvider, UtcTimeProvider};
pub use timing_belt::{PgTickStore, TickStore, TimingBelt};
pub use token::{TaskToken, TokenEvent, TokenState};
pub use worker::{HandlerError, HandlerRegistry, TaskHandler, WorkerPool};

/// Re-exported so handlers can name the cancellation type without adding
/// `tokio-util` themselves.
pub use tokio_util::sync::CancellationToken;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a `tracing` subscriber writing to stdout.
///
/// `RUST_LOG` wins when set; otherwise `level` is used, defaulting to
/// `info`. Calling this more than once is harmless: only the first call
/// installs a subscriber.
pub fn init_logging(level: Option<tracing::Level>) {
    let default_level = level.unwrap_or(tracing::Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
