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

use anyhow::{bail, Result};
use beltline::{Database, QueueConfig, QueueInfo};
use uuid::Uuid;

use crate::cli::OutputFormat;

pub async fn run(config: &QueueConfig, id: Uuid, format: OutputFormat) -> Result<()> {
    let info = QueueInfo::new(Database::new(config)?, config);
    let Some(result) = info.get_result(id).await? else {
        bail!("No result recorded for task {}", id);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Human => {
            println!("id:          {}", result.id);
            println!("type:        {}", result.task_type);
            println!("status:      {}", result.status);
            println!("errors:      {}", result.error_count);
            if let Some(error) = &result.last_error {
                println!(
                    "last error:  {}: {} (recoverable: {})",
                    error.error_type, error.message, result.last_error_is_recoverable
                );
            }
            println!("last run:    {} ms", result.processing_time_ms);
            if let Some(at) = result.processing_finalized_at_ts {
                println!("finalized:   {}", at);
            }
        }
    }
    Ok(())
}
