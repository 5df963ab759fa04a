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

//! Concurrency and ordering tests for the dequeue protocol.
//!
//! These verify that an advisory-lock lease is exclusive: however many
//! workers race for the same rows, every task is leased exactly once while
//! its lease is held.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beltline::{
    AbstractTimestamp, NewTask, QueueConsumer, QueueProducer, TaskResultQueue, TimingBelt,
};
use serde_json::json;
use serial_test::serial;
use tokio::sync::Barrier;

use crate::fixtures::{test_queue, test_queue_with};

/// Far enough in the future that every posted task is eligible.
fn later() -> AbstractTimestamp {
    AbstractTimestamp::new(1_000_000, 1_000_000)
}

#[tokio::test]
#[serial]
async fn test_concurrent_dequeue_leases_each_task_once() {
    let Some(queue) = test_queue_with(|b| b.max_concurrent_leases(64)).await else {
        return;
    };
    let db = queue.database();

    let producer = QueueProducer::new(db.clone(), queue.config());
    const NUM_TASKS: usize = 20;
    let mut posted = HashSet::new();
    for i in 0..NUM_TASKS {
        let task = producer
            .enqueue(NewTask::new("concurrent", json!({ "n": i })))
            .await
            .expect("Failed to enqueue task");
        posted.insert(task.id);
    }

    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = Arc::new(QueueConsumer::new(db.clone(), queue.config(), result_queue));

    const NUM_WORKERS: usize = 8;
    let barrier = Arc::new(Barrier::new(NUM_WORKERS));
    let mut handles = Vec::new();

    for worker_id in 0..NUM_WORKERS {
        let consumer = consumer.clone();
        let barrier = barrier.clone();

        handles.push(tokio::spawn(async move {
            barrier.wait().await;

            // Tokens are kept so their locks stay held until every worker
            // is done.
            let mut leased = Vec::new();
            for _ in 0..5 {
                match consumer.dequeue(later(), &[]).await {
                    Ok(Some(token)) => leased.push(token),
                    Ok(None) => {}
                    Err(e) => tracing::debug!("Worker {} dequeue error: {:?}", worker_id, e),
                }
            }
            leased
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.extend(handle.await.expect("Worker panicked"));
    }

    let mut seen = HashSet::new();
    for token in &tokens {
        assert!(
            seen.insert(token.id()),
            "Task {} was leased more than once",
            token.id()
        );
        assert!(queue.is_lock_held(token.task().lock_handle_id).await);
    }
    assert!(seen.is_subset(&posted));
    assert_eq!(consumer.live_lease_count(), tokens.len());

    // Whatever the racing workers left behind is still available, and
    // nothing already leased comes back.
    let mut remaining = Vec::new();
    while let Some(token) = consumer
        .dequeue(later(), &[])
        .await
        .expect("Failed to dequeue")
    {
        assert!(seen.insert(token.id()));
        remaining.push(token);
    }
    assert_eq!(seen, posted);

    for token in tokens.iter().chain(remaining.iter()) {
        token.release_lock().await;
    }
    assert_eq!(consumer.live_lease_count(), 0);

    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_dequeue_prefers_priority_then_age() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let db = queue.database();
    let producer = QueueProducer::new(db.clone(), queue.config());

    let old_low = producer
        .enqueue(NewTask::new("ordered", json!({})).with_priority(1))
        .await
        .unwrap();
    let high = producer
        .enqueue(NewTask::new("ordered", json!({})).with_priority(9))
        .await
        .unwrap();
    let new_low = producer
        .enqueue(NewTask::new("ordered", json!({})).with_priority(1))
        .await
        .unwrap();

    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = QueueConsumer::new(db.clone(), queue.config(), result_queue);

    let mut order = Vec::new();
    let mut held = Vec::new();
    while let Some(token) = consumer.dequeue(later(), &[]).await.unwrap() {
        order.push(token.id());
        held.push(token);
    }
    assert_eq!(order, vec![high.id, old_low.id, new_low.id]);

    for token in held {
        token.release_lock().await;
    }
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_dequeue_respects_type_filter_and_lock_time() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let db = queue.database();

    let belt = TimingBelt::new(db.clone(), queue.config());
    belt.start().await.unwrap();
    belt.tick().await.unwrap();

    let producer = QueueProducer::new(db.clone(), queue.config());
    let email = producer
        .enqueue(NewTask::new("email", json!({})))
        .await
        .unwrap();
    let delayed = producer
        .enqueue(NewTask::new("report", json!({})).with_delay(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(delayed.locked_until > email.locked_until);

    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = QueueConsumer::new(db.clone(), queue.config(), result_queue);

    // Eligibility is strictly after locked_until.
    let at_lock = AbstractTimestamp::new(delayed.locked_until, 1);
    assert!(consumer
        .dequeue(at_lock, &["report".to_string()])
        .await
        .unwrap()
        .is_none());

    let past_lock = AbstractTimestamp::new(delayed.locked_until + 1, 1);
    let token = consumer
        .dequeue(past_lock, &["report".to_string()])
        .await
        .unwrap()
        .expect("Delayed task should be eligible after its lock time");
    assert_eq!(token.id(), delayed.id);

    let other = consumer
        .dequeue(past_lock, &["email".to_string()])
        .await
        .unwrap()
        .expect("Email task should be eligible");
    assert_eq!(other.id(), email.id);

    token.release_lock().await;
    other.release_lock().await;
    belt.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_released_lease_can_be_taken_again() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let db = queue.database();
    let producer = QueueProducer::new(db.clone(), queue.config());
    let task = producer
        .enqueue(NewTask::new("again", json!({})))
        .await
        .unwrap();

    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = QueueConsumer::new(db.clone(), queue.config(), result_queue);

    let first = consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(consumer.is_leased(&task.id));
    assert!(consumer.dequeue(later(), &[]).await.unwrap().is_none());

    first.release_lock().await;
    assert!(!consumer.is_leased(&task.id));
    assert!(!queue.is_lock_held(task.lock_handle_id).await);

    let second = consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert_eq!(second.id(), task.id);
    second.release_lock().await;

    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_empty_dequeues_reuse_idle_session() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let db = queue.database();
    let producer = QueueProducer::new(db.clone(), queue.config());
    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    let consumer = QueueConsumer::new(db.clone(), queue.config(), result_queue);

    assert_eq!(consumer.idle_connection_count(), 0);
    for _ in 0..10 {
        assert!(consumer.dequeue(later(), &[]).await.unwrap().is_none());
        assert_eq!(consumer.idle_connection_count(), 1);
    }

    // The cached session is handed to the token that wins a lock.
    let posted = producer
        .enqueue(NewTask::new("after_idle", json!({})))
        .await
        .unwrap();
    let token = consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert_eq!(token.id(), posted.id);
    assert_eq!(consumer.idle_connection_count(), 0);
    assert!(queue.is_lock_held(posted.lock_handle_id).await);

    token.release_lock().await;
    assert!(!queue.is_lock_held(posted.lock_handle_id).await);
    queue.teardown().await;
}
