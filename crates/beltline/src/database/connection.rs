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

//! PostgreSQL connection management.
//!
//! Two kinds of connections are handed out:
//!
//! - **Pooled** clients from a `deadpool` pool, for short statements that do
//!   not depend on session state (posting tasks, writing results, ticking the
//!   clock, reading metrics).
//! - **Dedicated** connections, opened on demand and owned by exactly one
//!   component. Advisory locks and `LISTEN` subscriptions are session-scoped,
//!   so anything that relies on them must own its connection outright and
//!   must learn when that connection dies. A [`DedicatedConnection`] exposes
//!   that through [`closed`](DedicatedConnection::closed).
//!
//! # Example
//!
//! ```rust,ignore
//! use beltline::{Database, QueueConfig};
//!
//! let db = Database::new(&QueueConfig::default())?;
//! let client = db.get_client().await?;
//! client.simple_query("SELECT 1").await?;
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification};
use tracing::{debug, info, warn};

use super::mapping::QueueMapping;
use crate::config::QueueConfig;
use crate::error::QueueError;

/// `deadpool` manager producing `tokio_postgres` clients.
#[derive(Debug)]
pub struct PgConnectionManager {
    config: Config,
}

impl PgConnectionManager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl managed::Manager for PgConnectionManager {
    type Type = Client;
    type Error = tokio_postgres::Error;

    async fn create(&self) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Pooled connection closed with error");
            }
        });
        Ok(client)
    }

    async fn recycle(&self, client: &mut Client, _: &Metrics) -> RecycleResult<tokio_postgres::Error> {
        if client.is_closed() {
            return Err(RecycleError::Message("connection closed".into()));
        }
        client.simple_query("").await?;
        Ok(())
    }
}

pub type PgPool = managed::Pool<PgConnectionManager>;
pub type PooledClient = managed::Object<PgConnectionManager>;

/// Connection source for one queue.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    pg_config: Arc<Config>,
    mapping: QueueMapping,
    connect_retry_count: u32,
    connect_retry_delay: Duration,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("mapping", &self.mapping)
            .field("pool_status", &self.pool.status())
            .finish()
    }
}

impl Database {
    /// Builds the pool. No connection is opened until one is requested.
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let pg_config = Config::from_str(config.database_url())
            .map_err(|e| QueueError::configuration(format!("invalid database url: {}", e)))?;

        let pool = PgPool::builder(PgConnectionManager::new(pg_config.clone()))
            .max_size(config.db_pool_size() as usize)
            .build()
            .map_err(|e| QueueError::ConnectionPool(e.to_string()))?;

        info!(
            url = %config.redacted_database_url(),
            pool_size = config.db_pool_size(),
            prefix = config.mapping().prefix(),
            "PostgreSQL connection pool initialized"
        );

        Ok(Self {
            pool,
            pg_config: Arc::new(pg_config),
            mapping: config.mapping().clone(),
            connect_retry_count: config.connect_retry_count(),
            connect_retry_delay: config.connect_retry_delay(),
        })
    }

    pub fn mapping(&self) -> &QueueMapping {
        &self.mapping
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub(crate) fn connect_retry_count(&self) -> u32 {
        self.connect_retry_count
    }

    pub(crate) fn connect_retry_delay(&self) -> Duration {
        self.connect_retry_delay
    }

    /// Checks out a pooled client.
    pub async fn get_client(&self) -> Result<PooledClient, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionPool(e.to_string()))
    }

    /// Opens a dedicated connection, retrying transient failures.
    pub async fn connect_dedicated(&self) -> Result<DedicatedConnection, QueueError> {
        let (connection, _) = self.connect_with_retry(false).await?;
        Ok(connection)
    }

    /// Opens a dedicated connection whose `NOTIFY` messages are forwarded to
    /// the returned receiver.
    pub async fn connect_listening(
        &self,
    ) -> Result<(DedicatedConnection, mpsc::UnboundedReceiver<Notification>), QueueError> {
        let (connection, notifications) = self.connect_with_retry(true).await?;
        match notifications {
            Some(rx) => Ok((connection, rx)),
            None => Err(QueueError::Storage(
                "listening connection opened without a notification stream".into(),
            )),
        }
    }

    async fn connect_with_retry(
        &self,
        forward_notifications: bool,
    ) -> Result<(DedicatedConnection, Option<mpsc::UnboundedReceiver<Notification>>), QueueError>
    {
        let max_attempts = self.connect_retry_count + 1;
        let mut attempt = 1;

        loop {
            match open_dedicated(&self.pg_config, forward_notifications).await {
                Ok(opened) => return Ok(opened),
                Err(e) if attempt < max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=self.connect_retry_delay.as_millis() as u64 / 2);
                    let delay = self.connect_retry_delay + Duration::from_millis(jitter);
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Failed to open dedicated connection, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(QueueError::ConnectFailed {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

async fn open_dedicated(
    config: &Config,
    forward_notifications: bool,
) -> Result<(DedicatedConnection, Option<mpsc::UnboundedReceiver<Notification>>), tokio_postgres::Error>
{
    let started = Instant::now();
    let (client, mut connection) = config.connect(NoTls).await?;

    let (closed_tx, closed_rx) = watch::channel(false);
    let (notify_tx, notify_rx) = if forward_notifications {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let driver = tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if let Some(tx) = &notify_tx {
                        let _ = tx.send(notification);
                    }
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    debug!(notice = %notice.message(), "Server notice");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Dedicated connection failed");
                    break;
                }
            }
        }
        let _ = closed_tx.send(true);
    });

    let backend_pid: i32 = match client.query_one("SELECT pg_backend_pid()", &[]).await {
        Ok(row) => row.try_get(0)?,
        Err(e) => {
            driver.abort();
            return Err(e);
        }
    };

    let connection = DedicatedConnection {
        client,
        backend_pid,
        closed: closed_rx,
        driver,
        established_in: started.elapsed(),
    };
    debug!(backend_pid, elapsed = ?connection.established_in, "Dedicated connection opened");

    Ok((connection, notify_rx))
}

/// A connection owned by a single component.
///
/// Dropping it tears the session down, which releases every session-level
/// advisory lock and `LISTEN` subscription it held.
pub struct DedicatedConnection {
    client: Client,
    backend_pid: i32,
    closed: watch::Receiver<bool>,
    driver: JoinHandle<()>,
    established_in: Duration,
}

impl std::fmt::Debug for DedicatedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedConnection")
            .field("backend_pid", &self.backend_pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DedicatedConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Server process id of the session.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Time it took to establish the connection.
    pub fn established_in(&self) -> Duration {
        self.established_in
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.client.is_closed()
    }

    /// A signal that resolves when the connection goes away, usable without
    /// borrowing the connection.
    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal {
            closed: self.closed.clone(),
        }
    }
}

impl Drop for DedicatedConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Detached view of a [`DedicatedConnection`]'s liveness.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    closed: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn wait(&mut self) {
        loop {
            if *self.closed.borrow_and_update() {
                return;
            }
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }
}
