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

//! Start/stop guard shared by every long-running component.
//!
//! A [`StateController`] moves through `Stopped -> Starting -> Started ->
//! Stopping -> Stopped`. Transitions are serialized, so when several callers
//! race to start (or stop) a component exactly one of them runs the action
//! and the others simply observe the state it produced. A failing action
//! rolls the state back: a failed start leaves the component `Stopped`, a
//! failed stop leaves it `Started`.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComponentState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl ComponentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ComponentState::Starting,
            2 => ComponentState::Started,
            3 => ComponentState::Stopping,
            _ => ComponentState::Stopped,
        }
    }
}

#[derive(Debug)]
pub struct StateController {
    state: AtomicU8,
    transition: Mutex<()>,
}

impl Default for StateController {
    fn default() -> Self {
        Self::new()
    }
}

impl StateController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ComponentState::Stopped as u8),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ComponentState {
        ComponentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_started(&self) -> bool {
        self.state() == ComponentState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ComponentState::Stopped
    }

    /// Runs `start` if the component is stopped.
    ///
    /// Returns `Ok(true)` when this call performed the start, `Ok(false)`
    /// when the component was not in a startable state.
    pub async fn try_request_start<F, Fut, E>(&self, start: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.transition_with(
            ComponentState::Stopped,
            ComponentState::Starting,
            ComponentState::Started,
            start,
        )
        .await
    }

    /// Runs `stop` if the component is started.
    pub async fn try_request_stop<F, Fut, E>(&self, stop: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.transition_with(
            ComponentState::Started,
            ComponentState::Stopping,
            ComponentState::Stopped,
            stop,
        )
        .await
    }

    /// Forces the controller back to `Stopped`.
    pub fn reset(&self) {
        self.set(ComponentState::Stopped);
    }

    async fn transition_with<F, Fut, E>(
        &self,
        from: ComponentState,
        during: ComponentState,
        to: ComponentState,
        action: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _transition = self.transition.lock().await;
        if self.state() != from {
            return Ok(false);
        }

        self.set(during);
        let rollback = Rollback {
            controller: self,
            state: from,
            armed: true,
        };

        let outcome = action().await;
        rollback.disarm();

        match outcome {
            Ok(()) => {
                self.set(to);
                Ok(true)
            }
            Err(e) => {
                self.set(from);
                Err(e)
            }
        }
    }

    fn set(&self, state: ComponentState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Restores the pre-transition state if the action future is dropped
/// before it finishes.
struct Rollback<'a> {
    controller: &'a StateController,
    state: ComponentState,
    armed: bool,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.set(self.state);
        }
    }
}
