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

use anyhow::{Context, Result};
use beltline::{run_migrations, Database, QueueConfig};
use tracing::info;

pub async fn run(config: &QueueConfig) -> Result<()> {
    let db = Database::new(config)?;
    let applied = run_migrations(&db)
        .await
        .with_context(|| format!("Failed to set up queue at {}", config.redacted_database_url()))?;

    info!(applied = applied.len(), "Setup finished");
    if applied.is_empty() {
        println!("Queue '{}' is already up to date", config.mapping().prefix());
    } else {
        println!(
            "Queue '{}' set up, applied: {}",
            config.mapping().prefix(),
            applied.join(", ")
        );
    }
    Ok(())
}
