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

//! A single unit of work queued on a batch processor.
//!
//! A request is shared between the caller awaiting it and the processing
//! loop, so it carries its own completion slot. Whoever resolves it first
//! wins (the handler completing it, the caller's timeout firing, or the
//! processor cancelling it on stop); later attempts are ignored.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{QueueError, RequestError};

pub(crate) type Completion<R> = oneshot::Sender<Result<R, RequestError>>;

/// Per-request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Resolves the request as timed out when it elapses
    pub timeout: Option<Duration>,
    /// Failed attempts allowed before the request resolves with its error
    pub max_fail_count: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_fail_count: 3,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_fail_count(mut self, max_fail_count: u32) -> Self {
        self.max_fail_count = max_fail_count.max(1);
        self
    }
}

/// A queued request carrying a payload of type `P` and resolving to `R`.
pub struct BatchRequest<P, R> {
    id: u64,
    payload: P,
    max_fail_count: u32,
    fail_count: AtomicU32,
    completion: Mutex<Option<Completion<R>>>,
}

impl<P, R> std::fmt::Debug for BatchRequest<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRequest")
            .field("id", &self.id)
            .field("fail_count", &self.fail_count())
            .field("max_fail_count", &self.max_fail_count)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<P, R> BatchRequest<P, R> {
    pub(crate) fn new(id: u64, payload: P, max_fail_count: u32, completion: Completion<R>) -> Self {
        Self {
            id,
            payload,
            max_fail_count: max_fail_count.max(1),
            fail_count: AtomicU32::new(0),
            completion: Mutex::new(Some(completion)),
        }
    }

    /// Identifier, unique and increasing within one processor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Acquire)
    }

    pub fn max_fail_count(&self) -> u32 {
        self.max_fail_count
    }

    pub fn can_be_retried(&self) -> bool {
        self.fail_count() < self.max_fail_count
    }

    /// Whether the request has already been resolved in any way.
    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Resolves the request successfully. Returns `false` if it was already
    /// resolved.
    pub fn set_completed(&self, output: R) -> bool {
        self.resolve(Ok(output))
    }

    pub fn set_cancelled(&self) -> bool {
        self.resolve(Err(RequestError::Cancelled))
    }

    /// Records a failed attempt.
    ///
    /// The request only resolves with `error` once it has no attempts left;
    /// until then it stays pending so the processor can queue it again.
    /// Returns `true` if this call resolved the request.
    pub fn set_failed(&self, error: Arc<QueueError>) -> bool {
        if self.is_completed() {
            return false;
        }

        let attempts = self.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
        if attempts < self.max_fail_count {
            return false;
        }

        self.resolve(Err(RequestError::Failed {
            attempts,
            source: error,
        }))
    }

    pub(crate) fn set_timed_out(&self, timeout: Duration) -> bool {
        self.resolve(Err(RequestError::TimedOut(timeout)))
    }

    fn resolve(&self, outcome: Result<R, RequestError>) -> bool {
        match self.completion.lock().take() {
            Some(sender) => {
                // The caller may have stopped waiting, which is fine.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }
}
