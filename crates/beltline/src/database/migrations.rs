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

//! Embedded schema migrations.
//!
//! Migrations are SQL templates rendered with the queue's [`QueueMapping`],
//! applied in order inside one transaction and recorded in the queue's
//! migrations table. A transaction-scoped advisory lock keeps concurrent
//! setups from racing each other.

use tracing::{debug, info};

use super::connection::Database;
use super::mapping::QueueMapping;
use crate::error::QueueError;

/// A versioned SQL template.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: &'static str,
    pub template: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_create_queue",
        template: include_str!("sql/0001_create_queue.sql"),
    },
    Migration {
        version: "0002_lock_functions",
        template: include_str!("sql/0002_lock_functions.sql"),
    },
];

const MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS {migrations} (
    version varchar(100) PRIMARY KEY,
    applied_at timestamptz NOT NULL DEFAULT now()
)";

/// Renders every migration for `mapping`, in application order.
pub fn render_all(mapping: &QueueMapping) -> Vec<(&'static str, String)> {
    MIGRATIONS
        .iter()
        .map(|m| (m.version, mapping.render(m.template)))
        .collect()
}

/// Applies pending migrations. Returns the versions applied by this call.
pub async fn run_migrations(db: &Database) -> Result<Vec<&'static str>, QueueError> {
    let mapping = db.mapping().clone();
    let mut client = db.get_client().await?;
    let tx = client.transaction().await?;

    tx.execute(
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        &[&mapping.migrations_table()],
    )
    .await?;

    if let Some(schema) = mapping.schema() {
        tx.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .await?;
    }
    tx.batch_execute(&mapping.render(MIGRATIONS_TABLE)).await?;

    let applied_sql = mapping.render("SELECT version FROM {migrations}");
    let already_applied: Vec<String> = tx
        .query(applied_sql.as_str(), &[])
        .await?
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<Result<_, _>>()?;

    let record_sql = mapping.render("INSERT INTO {migrations} (version) VALUES ($1)");
    let mut applied = Vec::new();
    for (version, sql) in render_all(&mapping) {
        if already_applied.iter().any(|v| v == version) {
            debug!(version, "Migration already applied");
            continue;
        }

        tx.batch_execute(&sql).await?;
        tx.execute(record_sql.as_str(), &[&version]).await?;
        applied.push(version);
    }

    tx.commit().await?;

    info!(
        prefix = mapping.prefix(),
        applied = applied.len(),
        "Queue schema is up to date"
    );
    Ok(applied)
}
