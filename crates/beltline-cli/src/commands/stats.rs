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
use beltline::{Database, QueueConfig, QueueInfo, QueueMetrics, TaskStatus};

use crate::cli::OutputFormat;

const STATUSES: [TaskStatus; 7] = [
    TaskStatus::Unprocessed,
    TaskStatus::Processing,
    TaskStatus::Processed,
    TaskStatus::Error,
    TaskStatus::Faulted,
    TaskStatus::Fatal,
    TaskStatus::Cancelled,
];

pub async fn run(config: &QueueConfig, format: OutputFormat) -> Result<()> {
    let info = QueueInfo::new(Database::new(config)?, config);
    let metrics = info.compute_metrics().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metrics)?),
        OutputFormat::Human => print!("{}", render(config.mapping().prefix(), &metrics)),
    }
    Ok(())
}

fn render(prefix: &str, metrics: &QueueMetrics) -> String {
    let mut out = format!("Queue '{}'\n", prefix);
    for status in STATUSES {
        out.push_str(&format!("  {:<12} {:>8}\n", status.as_str(), metrics.count(status)));
    }
    out.push_str(&format!("  {:<12} {:>8}\n", "total", metrics.total));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_every_status() {
        let metrics = QueueMetrics {
            unprocessed: 3,
            fatal: 1,
            total: 4,
            ..Default::default()
        };
        let text = render("jobs", &metrics);

        assert!(text.starts_with("Queue 'jobs'\n"));
        assert_eq!(text.lines().count(), 1 + STATUSES.len() + 1);
        assert!(text.contains(&format!("  {:<12} {:>8}", TaskStatus::Unprocessed.as_str(), 3)));
        assert!(text.contains(&format!("  {:<12} {:>8}", "total", 4)));
    }
}
