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

//! End-to-end runs through [`QueueRunner`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beltline::{
    CancellationToken, ExponentialRetryPolicy, HandlerError, HandlerRegistry, NewTask,
    QueueMetrics, QueueRunner, QueuedTask, QueuedTaskError, TaskHandler, TaskStatus,
};
use serde::Deserialize;
use serde_json::json;
use serial_test::serial;

use crate::fixtures::{test_queue_with, TestQueue};

#[derive(Deserialize)]
struct Add {
    a: u64,
    b: u64,
}

struct Summer {
    total: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for Summer {
    async fn handle(&self, task: &QueuedTask, _: &CancellationToken) -> Result<(), HandlerError> {
        let add: Add = task.payload_as()?;
        self.total
            .fetch_add((add.a + add.b) as usize, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails `failures` times, then succeeds.
struct Flaky {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn handle(&self, _: &QueuedTask, _: &CancellationToken) -> Result<(), HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(HandlerError::Recoverable(QueuedTaskError::new(
                "Unavailable",
                format!("attempt {} failed", attempt + 1),
            )))
        } else {
            Ok(())
        }
    }
}

struct Broken;

#[async_trait]
impl TaskHandler for Broken {
    async fn handle(&self, _: &QueuedTask, _: &CancellationToken) -> Result<(), HandlerError> {
        Err(HandlerError::Fatal(QueuedTaskError::new(
            "Corrupt",
            "payload cannot be processed",
        )))
    }
}

async fn wait_for_metrics(
    runner: &QueueRunner,
    mut done: impl FnMut(&QueueMetrics) -> bool,
) -> QueueMetrics {
    let info = runner.queue_info();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let metrics = info.compute_metrics().await.expect("Failed to read metrics");
            if done(&metrics) {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Queue did not reach the expected state")
}

async fn runner_queue() -> Option<TestQueue> {
    test_queue_with(|b| {
        b.worker_count(3)
            .poll_fallback_interval(Duration::from_millis(100))
            .fault_error_threshold(5)
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_runner_processes_posted_tasks() {
    let Some(queue) = runner_queue().await else {
        return;
    };
    let total = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "add",
        Summer {
            total: total.clone(),
        },
    );

    let runner = QueueRunner::new(queue.config().clone(), handlers).unwrap();
    assert!(runner.start().await.unwrap());
    assert!(runner.is_running());
    // Starting twice is a no-op.
    assert!(!runner.start().await.unwrap());

    let producer = runner.producer();
    for i in 0..10_u64 {
        producer
            .enqueue(NewTask::new("add", json!({ "a": i, "b": 1 })))
            .await
            .unwrap();
    }

    let metrics = wait_for_metrics(&runner, |m| m.processed == 10).await;
    assert_eq!(metrics.total, 10);
    // 0 + 1 + ... + 9 plus one per task.
    assert_eq!(total.load(Ordering::SeqCst), 45 + 10);
    assert_eq!(runner.execution_stats().execution_cycles, 10);
    assert!(runner.timing_belt().last_known_time().ticks() > 0);

    assert!(runner.stop().await.unwrap());
    assert!(!runner.is_running());
    assert_eq!(runner.consumer().live_lease_count(), 0);
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_runner_retries_and_finalizes_failures() {
    let Some(queue) = runner_queue().await else {
        return;
    };
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "flaky",
            Flaky {
                failures: 2,
                attempts: attempts.clone(),
            },
        )
        .register("broken", Broken);

    let runner = QueueRunner::new(queue.config().clone(), handlers)
        .unwrap()
        .with_retry_policy(ExponentialRetryPolicy::new(1, Duration::from_millis(10)));
    runner.start().await.unwrap();

    let producer = runner.producer();
    let flaky = producer
        .enqueue(NewTask::new("flaky", json!({})))
        .await
        .unwrap();
    let broken = producer
        .enqueue(NewTask::new("broken", json!({})))
        .await
        .unwrap();

    wait_for_metrics(&runner, |m| m.processed == 1 && m.fatal == 1).await;

    let info = runner.queue_info();
    let flaky_result = info.get_result(flaky.id).await.unwrap().unwrap();
    assert_eq!(flaky_result.status, TaskStatus::Processed);
    assert_eq!(flaky_result.error_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let broken_result = info.get_result(broken.id).await.unwrap().unwrap();
    assert_eq!(broken_result.status, TaskStatus::Fatal);
    assert_eq!(broken_result.error_count, 1);
    assert_eq!(
        broken_result.last_error.map(|e| e.error_type),
        Some("Corrupt".to_string())
    );

    runner.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_runner_leaves_unhandled_types_alone() {
    let Some(queue) = runner_queue().await else {
        return;
    };
    let total = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "add",
        Summer {
            total: total.clone(),
        },
    );

    let runner = QueueRunner::new(queue.config().clone(), handlers).unwrap();
    runner.start().await.unwrap();

    let producer = runner.producer();
    let foreign = producer
        .enqueue(NewTask::new("somebody_else", json!({})))
        .await
        .unwrap();
    producer
        .enqueue(NewTask::new("add", json!({ "a": 2, "b": 2 })))
        .await
        .unwrap();

    wait_for_metrics(&runner, |m| m.processed == 1).await;
    runner.stop().await.unwrap();

    let result = runner
        .queue_info()
        .get_result(foreign.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, TaskStatus::Unprocessed);
    assert_eq!(total.load(Ordering::SeqCst), 4);

    queue.teardown().await;
}
