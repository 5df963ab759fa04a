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

//! Execution timing statistics kept by workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::timestamp::duration_to_ms;

/// Rolling timing figures for a stream of task executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionStats {
    pub last_execution_ms: i64,
    pub average_execution_ms: i64,
    pub fastest_execution_ms: i64,
    pub longest_execution_ms: i64,
    pub total_execution_ms: i64,
    pub execution_cycles: i64,
}

impl TaskExecutionStats {
    /// Folds one more execution into the figures.
    pub fn record(&mut self, elapsed: Duration) {
        let ms = duration_to_ms(elapsed);

        if self.execution_cycles == 0 {
            self.fastest_execution_ms = ms;
            self.longest_execution_ms = ms;
        } else {
            self.fastest_execution_ms = self.fastest_execution_ms.min(ms);
            self.longest_execution_ms = self.longest_execution_ms.max(ms);
        }

        self.last_execution_ms = ms;
        self.execution_cycles += 1;
        self.total_execution_ms = self.total_execution_ms.saturating_add(ms);
        self.average_execution_ms = self.total_execution_ms / self.execution_cycles;
    }
}
