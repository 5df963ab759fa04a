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

use anyhow::Result;
use beltline::{Database, QueueConfig, QueueInfo};

use crate::cli::OutputFormat;

pub async fn run(config: &QueueConfig, format: OutputFormat) -> Result<()> {
    let info = QueueInfo::new(Database::new(config)?, config);

    match (info.peek().await?, format) {
        (None, OutputFormat::Json) => println!("null"),
        (None, OutputFormat::Human) => println!("No eligible task"),
        (Some(task), OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(&task)?),
        (Some(task), OutputFormat::Human) => {
            println!("id:           {}", task.id);
            println!("type:         {}", task.task_type);
            println!("source:       {}", task.source);
            println!("priority:     {}", task.priority);
            println!("status:       {}", task.status);
            println!("posted at:    {} (tick {})", task.posted_at_ts, task.posted_at);
            println!("locked until: tick {}", task.locked_until);
            println!("payload:      {}", task.payload);
        }
    }
    Ok(())
}
