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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection establishment figures of one token's lock connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connect_count: AtomicU64,
    total_connect_micros: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record(&self, established_in: Duration) {
        let micros = u64::try_from(established_in.as_micros()).unwrap_or(u64::MAX);
        self.total_connect_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of connections opened, the initial one included.
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn average_connect_time(&self) -> Duration {
        match self.connect_count() {
            0 => Duration::ZERO,
            count => {
                Duration::from_micros(self.total_connect_micros.load(Ordering::Relaxed) / count)
            }
        }
    }
}
