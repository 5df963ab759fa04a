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

//! Posting tasks and reading the queue back.

use std::sync::Arc;

use beltline::{
    run_migrations, AbstractTimestamp, NewTask, QueueConsumer, QueueError, QueueInfo,
    QueueProducer, TaskResultQueue, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serial_test::serial;

use crate::fixtures::test_queue;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Invoice {
    number: u32,
    customer: String,
}

#[tokio::test]
#[serial]
async fn test_enqueue_writes_task_and_initial_result() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let producer = QueueProducer::new(queue.database(), queue.config());
    let info = QueueInfo::new(queue.database(), queue.config());

    let invoice = Invoice {
        number: 42,
        customer: "acme".into(),
    };
    let posted = producer
        .enqueue(
            NewTask::from_payload("invoice", &invoice)
                .unwrap()
                .with_source("billing")
                .with_priority(2),
        )
        .await
        .unwrap();

    assert_eq!(posted.task_type, "invoice");
    assert_eq!(posted.source, "billing");
    assert_eq!(posted.priority, 2);
    assert_eq!(posted.status, TaskStatus::Unprocessed);
    assert!(posted.lock_handle_id > 0);
    assert_eq!(posted.payload_as::<Invoice>().unwrap(), invoice);

    let result = info.get_result(posted.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Unprocessed);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.payload, posted.payload);
    assert!(result.first_processing_attempted_at_ts.is_none());

    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_invalid_task_is_rejected_without_side_effects() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let producer = QueueProducer::new(queue.database(), queue.config());
    let info = QueueInfo::new(queue.database(), queue.config());

    let err = producer
        .enqueue(NewTask::new("", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTask(_)));

    let err = producer
        .enqueue(NewTask::new("report", json!({})).with_priority(-5))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTask(_)));

    assert_eq!(info.compute_metrics().await.unwrap().total, 0);
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_peek_and_metrics_follow_the_queue() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let db = queue.database();
    let producer = QueueProducer::new(db.clone(), queue.config());
    let info = QueueInfo::new(db.clone(), queue.config());

    assert!(info.peek().await.unwrap().is_none());

    let low = producer
        .enqueue(NewTask::new("report", json!({})).with_priority(1))
        .await
        .unwrap();
    let high = producer
        .enqueue(NewTask::new("report", json!({})).with_priority(5))
        .await
        .unwrap();

    assert_eq!(info.peek().await.unwrap().map(|t| t.id), Some(high.id));
    let metrics = info.compute_metrics().await.unwrap();
    assert_eq!(metrics.unprocessed, 2);
    assert_eq!(metrics.total, 2);

    // A leased task is invisible to peek and counted as processing.
    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = QueueConsumer::new(db.clone(), queue.config(), result_queue);
    let token = consumer
        .dequeue(AbstractTimestamp::new(1, 1000), &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(token.id(), high.id);

    assert_eq!(info.peek().await.unwrap().map(|t| t.id), Some(low.id));
    let metrics = info.compute_metrics().await.unwrap();
    assert_eq!(metrics.count(TaskStatus::Processing), 1);
    assert_eq!(metrics.count(TaskStatus::Unprocessed), 1);

    token.release_lock().await;
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_migrations_are_idempotent() {
    let Some(queue) = test_queue().await else {
        return;
    };

    // The fixture already migrated the schema.
    let applied = run_migrations(&queue.database()).await.unwrap();
    assert!(applied.is_empty());

    queue.teardown().await;
}
