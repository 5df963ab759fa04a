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

use std::time::Duration;

use anyhow::{Context, Result};
use beltline::{Database, NewTask, QueueConfig, QueueProducer};

#[derive(Debug, Clone)]
pub struct PostArgs {
    pub task_type: String,
    pub payload: String,
    pub priority: i32,
    pub source: String,
    pub delay_ms: Option<u64>,
}

impl PostArgs {
    fn into_task(self) -> Result<NewTask> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("Payload is not valid JSON")?;

        let mut task = NewTask::new(self.task_type, payload)
            .with_source(self.source)
            .with_priority(self.priority);
        if let Some(ms) = self.delay_ms {
            task = task.with_delay(Duration::from_millis(ms));
        }
        Ok(task)
    }
}

pub async fn run(config: &QueueConfig, args: PostArgs) -> Result<()> {
    let task = args.into_task()?;
    let producer = QueueProducer::new(Database::new(config)?, config);
    let posted = producer.enqueue(task).await.context("Failed to post task")?;

    println!("{}", posted.id);
    Ok(())
}
