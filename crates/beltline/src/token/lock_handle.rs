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

//! A session-level advisory lock and the connection that holds it.
//!
//! The lock lives exactly as long as the session, so the two are owned
//! together. [`LockHandle::release`] is the one path that gives the lock up
//! on purpose; dropping a handle closes the session, which releases the lock
//! server-side as well.

use std::time::Duration;

use tokio_postgres::Client;
use tracing::{debug, warn};

use crate::database::{ClosedSignal, Database, DedicatedConnection};
use crate::error::QueueError;

pub struct LockHandle {
    connection: DedicatedConnection,
    key: i64,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("backend_pid", &self.connection.backend_pid())
            .finish()
    }
}

impl LockHandle {
    /// Wraps a connection that already holds the lock on `key`.
    pub(crate) fn new(connection: DedicatedConnection, key: i64) -> Self {
        Self { connection, key }
    }

    /// Opens a fresh connection and tries to take the lock on `key` again.
    ///
    /// `Ok(None)` means another session got the lock first.
    pub(crate) async fn reacquire(db: &Database, key: i64) -> Result<Option<Self>, QueueError> {
        let connection = db.connect_dedicated().await?;

        // A dropped session may still be shutting down and holding the lock.
        for attempt in 0..=db.connect_retry_count() {
            if attempt > 0 {
                tokio::time::sleep(db.connect_retry_delay()).await;
            }
            let row = connection
                .client()
                .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
                .await?;
            let granted: bool = row.try_get(0)?;
            if granted {
                return Ok(Some(Self::new(connection, key)));
            }
            debug!(key, attempt, "Advisory lock is held by another session");
        }

        Ok(None)
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn backend_pid(&self) -> i32 {
        self.connection.backend_pid()
    }

    pub fn established_in(&self) -> Duration {
        self.connection.established_in()
    }

    pub fn client(&self) -> &Client {
        self.connection.client()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        self.connection.closed_signal()
    }

    /// Unlocks `key`, drops any other advisory lock the session still holds
    /// and closes it. Returns whether the server confirmed the unlock of
    /// `key`; closing the session releases it either way.
    pub async fn release(self) -> bool {
        if self.connection.is_closed() {
            return false;
        }

        let client = self.connection.client();
        let unlocked = match client
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.key])
            .await
        {
            Ok(row) => row.try_get::<_, bool>(0).unwrap_or(false),
            Err(e) => {
                warn!(key = self.key, error = %e, "Advisory unlock failed, closing session instead");
                return false;
            }
        };

        if let Err(e) = client.batch_execute("SELECT pg_advisory_unlock_all()").await {
            warn!(key = self.key, error = %e, "Releasing remaining advisory locks failed");
        }
        unlocked
    }
}
