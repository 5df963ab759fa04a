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
use beltline::{QueueConfig, QueueMapping};
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    beltline::init_logging(Some(level));

    let config = build_config(&cli)?;

    match cli.command {
        Commands::Setup => commands::setup::run(&config).await,
        Commands::Post {
            ref task_type,
            ref payload,
            priority,
            ref source,
            delay_ms,
        } => {
            commands::post::run(
                &config,
                commands::post::PostArgs {
                    task_type: task_type.clone(),
                    payload: payload.clone(),
                    priority,
                    source: source.clone(),
                    delay_ms,
                },
            )
            .await
        }
        Commands::Stats { format } => commands::stats::run(&config, format).await,
        Commands::Peek { format } => commands::peek::run(&config, format).await,
        Commands::Result { id, format } => commands::result::run(&config, id, format).await,
    }
}

/// Environment settings first, then command-line overrides.
fn build_config(cli: &Cli) -> Result<QueueConfig> {
    let base = QueueConfig::from_env().context("Invalid queue settings in the environment")?;

    let mut builder = QueueConfig::builder()
        .database_url(base.database_url())
        .mapping(base.mapping().clone())
        .db_pool_size(2)
        .fault_error_threshold(base.fault_error_threshold());

    if let Some(url) = &cli.database_url {
        builder = builder.database_url(url.as_str());
    }
    if cli.prefix.is_some() || cli.schema.is_some() {
        let prefix = cli
            .prefix
            .as_deref()
            .unwrap_or_else(|| base.mapping().prefix());
        let schema = cli.schema.as_deref().or_else(|| base.mapping().schema());
        let mapping = QueueMapping::new(prefix, schema).context("Invalid queue prefix or schema")?;
        builder = builder.mapping(mapping);
    }

    Ok(builder.build())
}
