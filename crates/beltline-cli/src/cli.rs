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

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "beltline",
    version,
    about = "Administer beltline job queues",
    long_about = "Create queue schemas, post tasks and inspect queue state on PostgreSQL"
)]
pub struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Prefix of the queue's tables and functions
    #[arg(long, global = true, env = "BELTLINE_PREFIX")]
    pub prefix: Option<String>,

    /// Schema holding the queue objects
    #[arg(long, global = true, env = "BELTLINE_SCHEMA")]
    pub schema: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or upgrade the queue schema
    Setup,

    /// Post a task
    Post {
        /// Task type used to route the task to a handler
        task_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Higher priorities are dequeued first
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Who posted the task
        #[arg(long, default_value = "beltline-cli")]
        source: String,

        /// Wall-clock delay before the task becomes eligible, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Show task counts per status
    Stats {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show the task the next dequeue would pick, without leasing it
    Peek {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show the recorded result of a task
    Result {
        /// Task id
        id: Uuid,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
}
