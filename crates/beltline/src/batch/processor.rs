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

//! Coalesces concurrent requests into batched round trips.
//!
//! Callers [`submit`](BatchRequestProcessor::submit) requests from any task;
//! a single background loop takes one request (waiting if there is none),
//! then grabs up to `batch_size - 1` more without waiting, and hands the
//! whole batch to a [`BatchHandler`]. The handler resolves each request
//! individually, so one bad request never fails its neighbours.
//!
//! When the handler call itself fails, every unresolved request in the batch
//! is charged one failed attempt and queued again if it has attempts left.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::request::{BatchRequest, RequestOptions};
use crate::error::{QueueError, RequestError};
use crate::state_controller::StateController;

/// Shared handle to a request of handler `H`.
pub type Request<H> = Arc<BatchRequest<<H as BatchHandler>::Request, <H as BatchHandler>::Output>>;

/// Performs the round trip for one batch.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Output: Send + 'static;

    /// Processes `batch`, resolving each request with
    /// [`set_completed`](BatchRequest::set_completed) or charging it with
    /// [`set_failed`](BatchRequest::set_failed).
    ///
    /// Returning an error charges every request still unresolved.
    async fn process_batch(&self, batch: &[Request<Self>]) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
pub struct BatchProcessorOptions {
    pub batch_size: usize,
    pub request_options: RequestOptions,
    /// Process whatever is still queued when stopping instead of cancelling it
    pub process_remaining_on_stop: bool,
}

impl Default for BatchProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            request_options: RequestOptions::default(),
            process_remaining_on_stop: false,
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct BatchRequestProcessor<H: BatchHandler> {
    name: &'static str,
    handler: Arc<H>,
    options: BatchProcessorOptions,
    state: StateController,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Request<H>>>>,
    worker: parking_lot::Mutex<Option<Worker>>,
    next_id: AtomicU64,
}

impl<H: BatchHandler> BatchRequestProcessor<H> {
    pub fn new(name: &'static str, handler: H, options: BatchProcessorOptions) -> Self {
        Self {
            name,
            handler: Arc::new(handler),
            options,
            state: StateController::new(),
            sender: parking_lot::Mutex::new(None),
            worker: parking_lot::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_running(&self) -> bool {
        self.state.is_started()
    }

    pub async fn start(&self) -> Result<bool, QueueError> {
        self.state
            .try_request_start(|| async {
                let (tx, rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_loop(
                    self.name,
                    self.handler.clone(),
                    self.options.clone(),
                    rx,
                    cancel.clone(),
                ));

                *self.sender.lock() = Some(tx);
                *self.worker.lock() = Some(Worker { handle, cancel });
                debug!(processor = self.name, "Batch processor started");
                Ok(())
            })
            .await
    }

    /// Stops accepting requests and waits for the loop to finish.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        self.state
            .try_request_stop(|| async {
                // Dropping the sender completes the input queue.
                self.sender.lock().take();
                let worker = self.worker.lock().take();

                if let Some(worker) = worker {
                    worker.cancel.cancel();
                    if let Err(e) = worker.handle.await {
                        warn!(processor = self.name, error = %e, "Batch processor loop ended abnormally");
                    }
                }

                debug!(processor = self.name, "Batch processor stopped");
                Ok(())
            })
            .await
    }

    /// Submits a request with the processor's default options and waits for
    /// it to be resolved.
    pub async fn submit(&self, payload: H::Request) -> Result<H::Output, QueueError> {
        self.submit_with(payload, self.options.request_options).await
    }

    pub async fn submit_with(
        &self,
        payload: H::Request,
        options: RequestOptions,
    ) -> Result<H::Output, QueueError> {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(BatchRequest::new(id, payload, options.max_fail_count, tx));

        {
            let sender = self.sender.lock();
            let sender = sender
                .as_ref()
                .ok_or_else(|| QueueError::not_running(self.name))?;
            sender
                .send(request.clone())
                .map_err(|_| QueueError::not_running(self.name))?;
        }

        let outcome = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Lost races with a concurrent completion fall through to
                    // the value that completion delivered.
                    request.set_timed_out(timeout);
                    rx.await
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(resolved) => resolved.map_err(QueueError::from),
            Err(_) => Err(RequestError::Cancelled.into()),
        }
    }
}

impl<H: BatchHandler> Drop for BatchRequestProcessor<H> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }
}

async fn run_loop<H: BatchHandler>(
    name: &'static str,
    handler: Arc<H>,
    options: BatchProcessorOptions,
    mut rx: mpsc::UnboundedReceiver<Request<H>>,
    cancel: CancellationToken,
) {
    let batch_size = options.batch_size.max(1);
    let mut retries: VecDeque<Request<H>> = VecDeque::new();

    loop {
        let first = match retries.pop_front() {
            Some(request) => request,
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(request) => request,
                        None => break,
                    },
                }
            }
        };

        let mut batch = vec![first];
        while batch.len() < batch_size {
            if let Some(request) = retries.pop_front() {
                batch.push(request);
                continue;
            }
            match rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        // Requests that timed out while queued are already resolved.
        batch.retain(|request| !request.is_completed());
        if batch.is_empty() {
            continue;
        }

        if options.process_remaining_on_stop {
            process_batch(name, handler.as_ref(), &batch, &mut retries).await;
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    for request in &batch {
                        request.set_cancelled();
                    }
                    break;
                }
                _ = process_batch(name, handler.as_ref(), &batch, &mut retries) => {}
            }
        }
    }

    // Whatever is left: retries plus anything still in the closed channel.
    rx.close();
    while let Ok(request) = rx.try_recv() {
        retries.push_back(request);
    }

    if options.process_remaining_on_stop {
        debug!(processor = name, remaining = retries.len(), "Processing remaining requests");
        while !retries.is_empty() {
            let take = retries.len().min(batch_size);
            let batch: Vec<_> = retries
                .drain(..take)
                .filter(|request| !request.is_completed())
                .collect();
            if !batch.is_empty() {
                process_batch(name, handler.as_ref(), &batch, &mut retries).await;
            }
        }
    } else {
        for request in retries {
            request.set_cancelled();
        }
    }
}

async fn process_batch<H: BatchHandler>(
    name: &'static str,
    handler: &H,
    batch: &[Request<H>],
    retries: &mut VecDeque<Request<H>>,
) {
    debug!(processor = name, batch_size = batch.len(), "Processing batch");

    match handler.process_batch(batch).await {
        Ok(()) => {
            for request in batch {
                if request.is_completed() {
                    continue;
                }
                if request.fail_count() > 0 && request.can_be_retried() {
                    retries.push_back(request.clone());
                } else {
                    warn!(
                        processor = name,
                        request_id = request.id(),
                        "Handler left request unresolved; cancelling it"
                    );
                    request.set_cancelled();
                }
            }
        }
        Err(e) => {
            warn!(processor = name, error = %e, batch_size = batch.len(), "Batch failed");
            let error = Arc::new(e);
            for request in batch {
                if request.is_completed() {
                    continue;
                }
                if !request.set_failed(error.clone()) && !request.is_completed() {
                    retries.push_back(request.clone());
                }
            }
        }
    }
}
