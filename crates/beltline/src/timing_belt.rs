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

//! The timing belt: a logical clock shared by every process on a queue.
//!
//! Workers report how much wall-clock time they spent executing tasks with
//! [`TimingBelt::add_wallclock_cost`]. Each [`tick`](TimingBelt::tick)
//! advances the persisted tick counter and folds the cost reported since the
//! previous tick into the persisted total, in one atomic `UPDATE`. Ticks
//! requested concurrently are coalesced: a batch of `n` requests advances
//! the counter by `n` in a single round trip and every request in the batch
//! observes the same resulting timestamp.
//!
//! Retry delays are stored as absolute ticks computed from the persisted
//! counter, so every machine agrees on when a task becomes eligible again no
//! matter how far their clocks drift apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{
    BatchHandler, BatchProcessorOptions, BatchRequestProcessor, Request, RequestOptions,
};
use crate::config::QueueConfig;
use crate::database::Database;
use crate::error::QueueError;
use crate::model::timestamp::duration_to_ms;
use crate::model::AbstractTimestamp;
use crate::state_controller::StateController;

/// Persistence for logical time.
#[async_trait]
pub trait TickStore: Send + Sync + 'static {
    /// Creates the time row if it does not exist yet.
    async fn ensure_time(&self, time_id: Uuid, initial_cost_ms: i64) -> Result<(), QueueError>;

    /// Atomically adds `ticks` and `cost_ms` to the time row and returns the
    /// new totals.
    async fn advance(
        &self,
        time_id: Uuid,
        ticks: i64,
        cost_ms: i64,
    ) -> Result<AbstractTimestamp, QueueError>;

    /// Reads the current totals.
    async fn current(&self, time_id: Uuid) -> Result<AbstractTimestamp, QueueError>;
}

/// [`TickStore`] backed by the queue's time table.
#[derive(Debug, Clone)]
pub struct PgTickStore {
    db: Database,
    insert_sql: String,
    advance_sql: String,
    current_sql: String,
}

impl PgTickStore {
    pub fn new(db: Database) -> Self {
        let mapping = db.mapping();
        Self {
            insert_sql: mapping.render(
                "INSERT INTO {time} (time_id, total_ticks, total_ticks_cost)
                 VALUES ($1, 0, $2)
                 ON CONFLICT (time_id) DO NOTHING",
            ),
            advance_sql: mapping.render(
                "UPDATE {time}
                 SET total_ticks = total_ticks + $2,
                     total_ticks_cost = total_ticks_cost + $3
                 WHERE time_id = $1
                 RETURNING total_ticks, total_ticks_cost",
            ),
            current_sql: mapping
                .render("SELECT total_ticks, total_ticks_cost FROM {time} WHERE time_id = $1"),
            db,
        }
    }
}

#[async_trait]
impl TickStore for PgTickStore {
    async fn ensure_time(&self, time_id: Uuid, initial_cost_ms: i64) -> Result<(), QueueError> {
        let client = self.db.get_client().await?;
        client
            .execute(self.insert_sql.as_str(), &[&time_id, &initial_cost_ms])
            .await?;
        Ok(())
    }

    async fn advance(
        &self,
        time_id: Uuid,
        ticks: i64,
        cost_ms: i64,
    ) -> Result<AbstractTimestamp, QueueError> {
        let client = self.db.get_client().await?;
        let row = client
            .query_opt(self.advance_sql.as_str(), &[&time_id, &ticks, &cost_ms])
            .await?
            .ok_or_else(|| QueueError::Storage(format!("time row {} does not exist", time_id)))?;
        Ok(AbstractTimestamp::new(row.try_get(0)?, row.try_get(1)?))
    }

    async fn current(&self, time_id: Uuid) -> Result<AbstractTimestamp, QueueError> {
        let client = self.db.get_client().await?;
        let row = client
            .query_opt(self.current_sql.as_str(), &[&time_id])
            .await?
            .ok_or_else(|| QueueError::Storage(format!("time row {} does not exist", time_id)))?;
        Ok(AbstractTimestamp::new(row.try_get(0)?, row.try_get(1)?))
    }
}

#[derive(Debug, Default)]
struct CostAccumulator {
    since_last_tick: i64,
    total: i64,
}

#[derive(Debug)]
struct BeltState {
    cost: Mutex<CostAccumulator>,
    last_time: Mutex<AbstractTimestamp>,
}

impl BeltState {
    fn take_cost(&self) -> i64 {
        std::mem::take(&mut self.cost.lock().since_last_tick)
    }

    fn restore_cost(&self, cost: i64) {
        let mut acc = self.cost.lock();
        acc.since_last_tick = acc.since_last_tick.saturating_add(cost);
    }
}

/// Cost taken from the accumulator for one round trip. Unless the round
/// trip persisted it, dropping the guard puts it back, including when the
/// batch is cancelled mid-flight.
struct PendingCost {
    state: Arc<BeltState>,
    cost: i64,
    persisted: bool,
}

impl Drop for PendingCost {
    fn drop(&mut self) {
        if !self.persisted {
            self.state.restore_cost(self.cost);
        }
    }
}

struct TickHandler {
    time_id: Uuid,
    store: Arc<dyn TickStore>,
    state: Arc<BeltState>,
}

#[async_trait]
impl BatchHandler for TickHandler {
    type Request = ();
    type Output = AbstractTimestamp;

    async fn process_batch(&self, batch: &[Request<Self>]) -> Result<(), QueueError> {
        let ticks = batch.len() as i64;
        let mut pending = PendingCost {
            state: self.state.clone(),
            cost: self.state.take_cost(),
            persisted: false,
        };
        let cost = pending.cost;

        match self.store.advance(self.time_id, ticks, cost).await {
            Ok(now) => {
                pending.persisted = true;
                *self.state.last_time.lock() = now;
                for request in batch {
                    request.set_completed(now);
                }
                counter!("beltline.timing_belt.ticks").increment(ticks as u64);
                debug!(ticks, cost_ms = cost, now = %now, "Timing belt advanced");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Shared logical clock of one queue.
pub struct TimingBelt {
    time_id: Uuid,
    initial_cost_ms: i64,
    tick_timeout: Duration,
    tick_max_fail_count: u32,
    store: Arc<dyn TickStore>,
    state: Arc<BeltState>,
    processor: BatchRequestProcessor<TickHandler>,
    controller: StateController,
}

impl std::fmt::Debug for TimingBelt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingBelt")
            .field("time_id", &self.time_id)
            .field("last_time", &self.last_known_time())
            .field("state", &self.controller.state())
            .finish()
    }
}

impl TimingBelt {
    /// A belt persisting time in the queue's time table.
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self::with_store(Arc::new(PgTickStore::new(db)), config)
    }

    pub fn with_store(store: Arc<dyn TickStore>, config: &QueueConfig) -> Self {
        let state = Arc::new(BeltState {
            cost: Mutex::new(CostAccumulator::default()),
            last_time: Mutex::new(AbstractTimestamp::new(0, config.initial_wallclock_cost_ms())),
        });

        let handler = TickHandler {
            time_id: config.time_id(),
            store: store.clone(),
            state: state.clone(),
        };
        let processor = BatchRequestProcessor::new(
            "TimingBelt",
            handler,
            BatchProcessorOptions {
                batch_size: config.tick_batch_size(),
                request_options: RequestOptions {
                    timeout: Some(config.tick_timeout()),
                    max_fail_count: config.tick_max_fail_count(),
                },
                process_remaining_on_stop: false,
            },
        );

        Self {
            time_id: config.time_id(),
            initial_cost_ms: config.initial_wallclock_cost_ms(),
            tick_timeout: config.tick_timeout(),
            tick_max_fail_count: config.tick_max_fail_count(),
            store,
            state,
            processor,
            controller: StateController::new(),
        }
    }

    pub fn time_id(&self) -> Uuid {
        self.time_id
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_started()
    }

    pub async fn start(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_start(|| async {
                self.store
                    .ensure_time(self.time_id, self.initial_cost_ms)
                    .await?;
                *self.state.last_time.lock() = self.store.current(self.time_id).await?;
                self.processor.start().await?;
                info!(time_id = %self.time_id, now = %self.last_known_time(), "Timing belt started");
                Ok(())
            })
            .await
    }

    /// Stops the belt. Ticks still waiting are resolved as cancelled.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        self.controller
            .try_request_stop(|| async {
                self.processor.stop().await?;
                info!(time_id = %self.time_id, "Timing belt stopped");
                Ok(())
            })
            .await
    }

    /// Attributes `elapsed` wall-clock time to the clock.
    pub fn add_wallclock_cost(&self, elapsed: Duration) {
        self.add_wallclock_cost_ms(duration_to_ms(elapsed));
    }

    pub fn add_wallclock_cost_ms(&self, elapsed_ms: i64) {
        if elapsed_ms <= 0 {
            return;
        }
        let mut acc = self.state.cost.lock();
        acc.since_last_tick = acc.since_last_tick.saturating_add(elapsed_ms);
        acc.total = acc.total.saturating_add(elapsed_ms);
    }

    /// Cost reported since the last successful tick.
    pub fn wallclock_cost_since_last_tick(&self) -> i64 {
        self.state.cost.lock().since_last_tick
    }

    /// Everything reported through this belt since it was created.
    pub fn total_wallclock_cost(&self) -> i64 {
        self.state.cost.lock().total
    }

    /// The timestamp produced by the most recent successful tick.
    pub fn last_known_time(&self) -> AbstractTimestamp {
        *self.state.last_time.lock()
    }

    /// Advances the clock by one tick, sharing the round trip with any
    /// concurrent callers.
    pub async fn tick(&self) -> Result<AbstractTimestamp, QueueError> {
        self.tick_with_timeout(self.tick_timeout).await
    }

    pub async fn tick_with_timeout(&self, timeout: Duration) -> Result<AbstractTimestamp, QueueError> {
        let outcome = self
            .processor
            .submit_with(
                (),
                RequestOptions {
                    timeout: Some(timeout),
                    max_fail_count: self.tick_max_fail_count,
                },
            )
            .await;

        if let Err(e) = &outcome {
            warn!(time_id = %self.time_id, error = %e, "Tick request did not complete");
        }
        outcome
    }

    /// Reads the persisted time without advancing it.
    pub async fn current_time(&self) -> Result<AbstractTimestamp, QueueError> {
        self.store.current(self.time_id).await
    }

    /// Persisted tick count plus `ticks_to_add`.
    pub async fn compute_absolute_ticks(&self, ticks_to_add: i64) -> Result<i64, QueueError> {
        let now = self.current_time().await?;
        Ok(now.ticks().saturating_add(ticks_to_add))
    }

    /// Absolute tick at which `delay` of wall-clock time will have passed,
    /// priced at the persisted tick duration.
    pub async fn compute_ticks_after(&self, delay: Duration) -> Result<i64, QueueError> {
        let now = self.current_time().await?;
        Ok(now
            .ticks()
            .saturating_add(now.ticks_for_wallclock_duration(duration_to_ms(delay))))
    }
}
