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

//! Keeps a live token's lock connection alive.
//!
//! The watchdog only holds a weak reference to its token, so a token that is
//! dropped without being released still goes away; closing its session then
//! ends the watch.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{LockHandle, TokenEvent, TokenShared, TokenState};

pub(super) fn spawn(shared: &Arc<TokenShared>) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let cancel = shared.cancel.clone();

    tokio::spawn(async move {
        loop {
            let Some(mut closed) = current_signal(&weak).await else {
                return;
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = closed.wait() => {}
            }

            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !reconnect(&shared).await {
                return;
            }
        }
    })
}

async fn current_signal(weak: &Weak<TokenShared>) -> Option<crate::database::ClosedSignal> {
    let shared = weak.upgrade()?;
    let slot = shared.lock.lock().await;
    slot.as_ref().map(LockHandle::closed_signal)
}

/// Replaces a dropped lock connection. Returns `false` when the token is
/// done, either because it finished meanwhile or because the lock is lost.
async fn reconnect(shared: &TokenShared) -> bool {
    // Holding the slot closes the gate for the token's own operations.
    let mut slot = shared.lock.lock().await;
    if !shared.state().is_live() || shared.cancel.is_cancelled() {
        return false;
    }
    if slot.as_ref().is_some_and(|handle| !handle.is_closed()) {
        // Someone else already replaced it.
        return true;
    }

    let task_id = shared.task.id;
    let key = shared.task.lock_handle_id;
    warn!(%task_id, key, "Lock connection dropped");
    shared.emit(TokenEvent::ConnectionDropped);
    counter!("beltline.tokens.connection_dropped").increment(1);
    slot.take();

    shared.emit(TokenEvent::AttemptingToReconnect);
    match LockHandle::reacquire(&shared.env.db, key).await {
        Ok(Some(handle)) => {
            let backend_pid = handle.backend_pid();
            shared.stats.record(handle.established_in());
            *slot = Some(handle);
            info!(%task_id, key, backend_pid, "Advisory lock re-acquired on new connection");
            shared.emit(TokenEvent::ConnectionEstablished { backend_pid });
            true
        }
        outcome => {
            let reason = match outcome {
                Ok(_) => String::from("lock taken by another session"),
                Err(e) => e.to_string(),
            };
            error!(%task_id, key, reason = %reason, "Lost the task lock permanently");
            counter!("beltline.tokens.lock_lost").increment(1);
            shared.emit(TokenEvent::ConnectionFailedPermanently { reason });

            shared.finish(TokenState::Cancelled);
            shared.cancel.cancel();
            shared.is_locked.store(false, Ordering::Release);
            shared.fire_released();
            false
        }
    }
}
