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

//! Logical time shared by every process attached to one queue.
//!
//! An [`AbstractTimestamp`] pairs a tick count with the wall-clock time (in
//! milliseconds) that workers reported as spent while those ticks elapsed.
//! The ratio between the two is the current real-time cost of a tick, which
//! is what lets a "retry in 10 seconds" request be stored as a tick offset
//! that every machine interprets the same way regardless of its own clock.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable `(ticks, wallclock cost)` pair.
///
/// Ordering compares ticks first, then cost.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AbstractTimestamp {
    ticks: i64,
    wallclock_time_cost: i64,
}

impl AbstractTimestamp {
    pub const ZERO: AbstractTimestamp = AbstractTimestamp {
        ticks: 0,
        wallclock_time_cost: 0,
    };

    pub fn new(ticks: i64, wallclock_time_cost: i64) -> Self {
        Self {
            ticks,
            wallclock_time_cost,
        }
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    /// Total wall-clock milliseconds attributed to [`ticks`](Self::ticks).
    pub fn wallclock_time_cost(&self) -> i64 {
        self.wallclock_time_cost
    }

    /// Real-time milliseconds one tick is currently worth, rounded down.
    ///
    /// Zero when no ticks have elapsed yet.
    pub fn tick_duration(&self) -> i64 {
        if self.ticks > 0 {
            self.wallclock_time_cost / self.ticks
        } else {
            0
        }
    }

    /// Number of ticks equivalent to `duration_ms` of wall-clock time,
    /// rounded up so that a non-zero delay never converts to zero ticks.
    pub fn ticks_for_wallclock_duration(&self, duration_ms: i64) -> i64 {
        if self.ticks <= 0 || self.wallclock_time_cost <= 0 || duration_ms <= 0 {
            return 0;
        }

        // i128 keeps `duration * ticks` exact for any pair of i64 inputs.
        let numerator = duration_ms as i128 * self.ticks as i128;
        let cost = self.wallclock_time_cost as i128;
        let ticks = (numerator + cost - 1) / cost;

        i64::try_from(ticks).unwrap_or(i64::MAX)
    }

    /// Advances by the tick equivalent of `duration_ms`, carrying the cost.
    pub fn add_wallclock_duration_ms(&self, duration_ms: i64) -> Self {
        Self {
            ticks: self
                .ticks
                .saturating_add(self.ticks_for_wallclock_duration(duration_ms)),
            wallclock_time_cost: self.wallclock_time_cost.saturating_add(duration_ms.max(0)),
        }
    }

    pub fn add_wallclock_duration(&self, duration: Duration) -> Self {
        self.add_wallclock_duration_ms(duration_to_ms(duration))
    }

    /// Advances by `ticks`, costing each at the current tick duration.
    pub fn add_ticks(&self, ticks: i64) -> Self {
        Self {
            ticks: self.ticks.saturating_add(ticks),
            wallclock_time_cost: self
                .wallclock_time_cost
                .saturating_add(self.tick_duration().saturating_mul(ticks)),
        }
    }

    /// A timestamp at absolute tick `ticks`, priced at this timestamp's
    /// tick duration.
    pub fn from_ticks(&self, ticks: i64) -> Self {
        Self {
            ticks,
            wallclock_time_cost: self.tick_duration().saturating_mul(ticks),
        }
    }
}

impl fmt::Display for AbstractTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ticks ({} ms, {} ms/tick)",
            self.ticks,
            self.wallclock_time_cost,
            self.tick_duration()
        )
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
