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

//! `LISTEN`/`NOTIFY` listener for newly posted tasks.
//!
//! The listener keeps one dedicated connection subscribed to the queue's
//! notification channel and turns what it observes into [`ListenerEvent`]s:
//!
//! - a notification arrived: [`ListenerEvent::NewTaskPosted`]
//! - nothing arrived within the wait timeout:
//!   [`ListenerEvent::TimedOutWhileWaiting`], which consumers use as a poll
//!   fallback in case a notification was missed
//! - the connection was lost and re-established:
//!   [`ListenerEvent::ConnectionRestored`]
//!
//! A lost connection is never fatal. The loop drops it, waits the configured
//! reconnect delay and subscribes again until the listener is stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! let listener = NotificationListener::new(db, &config);
//! let mut events = listener.subscribe();
//! listener.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_postgres::Notification;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::database::{Database, DedicatedConnection};
use crate::error::QueueError;
use crate::state_controller::StateController;

const EVENT_CAPACITY: usize = 256;

/// What the listener observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The first subscription after start succeeded.
    Connected { backend_pid: i32 },
    /// A subscription was re-established after the connection was lost.
    ConnectionRestored { backend_pid: i32 },
    /// A producer announced a new task. Carries the notification payload.
    NewTaskPosted { payload: String },
    /// No notification arrived within the wait timeout.
    TimedOutWhileWaiting,
}

/// Point-in-time copy of the listener's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerDiagnostics {
    pub notification_count: u64,
    pub reconnect_count: u64,
    pub wait_timeout_count: u64,
    /// Backend pid of the current subscription, 0 when not connected
    pub backend_pid: i32,
}

#[derive(Debug, Default)]
struct Counters {
    notifications: AtomicU64,
    reconnects: AtomicU64,
    wait_timeouts: AtomicU64,
    backend_pid: AtomicI32,
}

struct Shared {
    db: Database,
    channel: String,
    wait_timeout: Duration,
    reconnect_delay: Duration,
    events: broadcast::Sender<ListenerEvent>,
    counters: Counters,
}

impl Shared {
    fn emit(&self, event: ListenerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn subscribe(
        &self,
    ) -> Result<(DedicatedConnection, mpsc::UnboundedReceiver<Notification>), QueueError> {
        let (connection, notifications) = self.db.connect_listening().await?;
        connection
            .client()
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await?;
        Ok((connection, notifications))
    }
}

struct Running {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Subscribes to the queue's notification channel and reconnects as needed.
pub struct NotificationListener {
    shared: Arc<Shared>,
    controller: StateController,
    running: parking_lot::Mutex<Option<Running>>,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("channel", &self.shared.channel)
            .field("state", &self.controller.state())
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

impl NotificationListener {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                channel: db.mapping().notification_channel(),
                db,
                wait_timeout: config.listener_wait_timeout(),
                reconnect_delay: config.listener_reconnect_delay(),
                events,
                counters: Counters::default(),
            }),
            controller: StateController::new(),
            running: parking_lot::Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_started()
    }

    pub fn diagnostics(&self) -> ListenerDiagnostics {
        let c = &self.shared.counters;
        ListenerDiagnostics {
            notification_count: c.notifications.load(Ordering::Relaxed),
            reconnect_count: c.reconnects.load(Ordering::Relaxed),
            wait_timeout_count: c.wait_timeouts.load(Ordering::Relaxed),
            backend_pid: c.backend_pid.load(Ordering::Relaxed),
        }
    }

    /// Starts listening. Returns once the first subscription is in place.
    ///
    /// If the first subscription cannot be made within the connection retry
    /// budget the error is returned and the listener stays stopped.
    pub async fn start(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_start(|| async {
                let cancel = CancellationToken::new();
                let (ready_tx, ready_rx) = oneshot::channel();
                let handle = tokio::spawn(listen_loop(
                    self.shared.clone(),
                    cancel.clone(),
                    ready_tx,
                ));

                match ready_rx.await {
                    Ok(Ok(())) => {
                        *self.running.lock() = Some(Running { handle, cancel });
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        cancel.cancel();
                        let _ = handle.await;
                        Err(e)
                    }
                    Err(_) => Err(QueueError::Storage(
                        "listener loop exited before subscribing".into(),
                    )),
                }
            })
            .await
    }

    pub async fn stop(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_stop(|| async {
                let running = self.running.lock().take();
                if let Some(running) = running {
                    running.cancel.cancel();
                    if let Err(e) = running.handle.await {
                        warn!(channel = %self.shared.channel, error = %e, "Listener loop ended abnormally");
                    }
                }
                self.shared.counters.backend_pid.store(0, Ordering::Relaxed);
                info!(channel = %self.shared.channel, "Notification listener stopped");
                Ok(())
            })
            .await
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

async fn listen_loop(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), QueueError>>,
) {
    let mut ready = Some(ready);
    let mut connected_before = false;

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            subscribed = shared.subscribe() => subscribed,
        };

        let (connection, mut notifications) = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                    return;
                }
                warn!(channel = %shared.channel, error = %e, "Failed to re-subscribe, retrying");
                if sleep_or_cancelled(shared.reconnect_delay, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let backend_pid = connection.backend_pid();
        shared
            .counters
            .backend_pid
            .store(backend_pid, Ordering::Relaxed);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        if connected_before {
            shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            counter!("beltline.listener.reconnects").increment(1);
            info!(channel = %shared.channel, backend_pid, "Listener connection restored");
            shared.emit(ListenerEvent::ConnectionRestored { backend_pid });
        } else {
            info!(channel = %shared.channel, backend_pid, "Listening for posted tasks");
            shared.emit(ListenerEvent::Connected { backend_pid });
        }
        connected_before = true;

        let mut closed = connection.closed_signal();
        let stopping = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                _ = closed.wait() => break false,
                waited = tokio::time::timeout(shared.wait_timeout, notifications.recv()) => {
                    match waited {
                        Ok(Some(notification)) => {
                            shared.counters.notifications.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                channel = %notification.channel(),
                                payload = %notification.payload(),
                                "Received task notification"
                            );
                            shared.emit(ListenerEvent::NewTaskPosted {
                                payload: notification.payload().to_string(),
                            });
                        }
                        // The driver ended; the connection is gone.
                        Ok(None) => break false,
                        Err(_) => {
                            shared.counters.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                            shared.emit(ListenerEvent::TimedOutWhileWaiting);
                        }
                    }
                }
            }
        };

        if stopping {
            if let Err(e) = connection
                .client()
                .batch_execute(&format!("UNLISTEN {}", shared.channel))
                .await
            {
                debug!(error = %e, "UNLISTEN failed during shutdown");
            }
            return;
        }

        shared.counters.backend_pid.store(0, Ordering::Relaxed);
        warn!(channel = %shared.channel, backend_pid, "Listener connection lost, reconnecting");
        drop(connection);
        if sleep_or_cancelled(shared.reconnect_delay, &cancel).await {
            return;
        }
    }
}

/// Sleeps for `delay`; returns `true` if cancelled first.
async fn sleep_or_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
