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

//! Error types shared across the queue.
//!
//! Infrastructure failures (connection drops, pool exhaustion, timeouts) are
//! reported through [`QueueError`]. Individual requests submitted to a
//! [`BatchRequestProcessor`](crate::batch::BatchRequestProcessor) resolve
//! with a [`RequestError`] so that a failure of one request never aborts the
//! siblings that happened to share its batch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::database::IdentifierError;
use crate::escalation::EscalationError;

/// Crate-wide result alias.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Errors raised by queue components.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A statement failed on an established connection.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// The shared connection pool could not hand out a connection.
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// A dedicated connection could not be opened within the retry budget.
    #[error("Failed to connect after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// A task submitted for posting failed validation.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// The component was used while not started.
    #[error("{component} is not running")]
    NotRunning { component: &'static str },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row expected by the protocol was missing or malformed.
    #[error("Unexpected storage state: {0}")]
    Storage(String),
}

impl QueueError {
    pub(crate) fn not_running(component: &'static str) -> Self {
        QueueError::NotRunning { component }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        QueueError::Configuration {
            message: message.into(),
        }
    }

    /// Whether the error came from the transport rather than the statement.
    ///
    /// The poller reports these as a transient outage and tries again on
    /// the next signal.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Database(e) => e.is_closed(),
            QueueError::ConnectFailed { .. } | QueueError::ConnectionPool(_) => true,
            _ => false,
        }
    }
}

/// How a request submitted to a batch processor was resolved when it did not
/// complete successfully.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The request was cancelled, either explicitly or because its processor
    /// stopped before it could be handled.
    #[error("Request was cancelled")]
    Cancelled,

    /// The request's own timeout elapsed before it was completed.
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    /// Every allowed attempt failed; carries the error of the last attempt.
    #[error("Request failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        source: Arc<QueueError>,
    },
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled | RequestError::TimedOut(_))
    }
}
