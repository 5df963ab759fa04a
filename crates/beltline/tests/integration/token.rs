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

//! Lease lifecycle of a task token against a live server.

use std::sync::Arc;
use std::time::Duration;

use beltline::{
    AbstractTimestamp, FixedTimeProvider, NewTask, QueueConsumer, QueueInfo, QueueProducer,
    QueuedTaskError, TaskExecutionResult, TaskResultQueue, TaskStatus, TokenEvent, TokenState,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use serial_test::serial;

use crate::fixtures::{test_queue, test_queue_with, TestQueue};

const LEASE: Duration = Duration::from_secs(30);

fn later() -> AbstractTimestamp {
    AbstractTimestamp::new(1_000_000, 1_000_000)
}

struct Harness {
    producer: QueueProducer,
    consumer: QueueConsumer,
    info: QueueInfo,
    result_queue: Arc<TaskResultQueue>,
}

async fn harness(queue: &TestQueue) -> Harness {
    let db = queue.database();
    let result_queue = Arc::new(TaskResultQueue::new(db.clone(), queue.config()));
    result_queue
        .start()
        .await
        .expect("Failed to start result queue");

    Harness {
        producer: QueueProducer::new(db.clone(), queue.config()),
        consumer: QueueConsumer::new(db.clone(), queue.config(), result_queue.clone()),
        info: QueueInfo::new(db, queue.config()),
        result_queue,
    }
}

#[tokio::test]
#[serial]
async fn test_successful_task_is_removed_and_unlocked() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("thumbnail", json!({ "id": 1 })))
        .await
        .unwrap();

    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert_eq!(token.state(), TokenState::Pending);
    assert_eq!(
        queue.task_status(posted.id).await,
        Some(TaskStatus::Processing.as_i16())
    );

    assert!(token.try_set_started(LEASE).await.unwrap());
    assert_eq!(token.state(), TokenState::Active);
    assert!(token.is_locked());
    assert!(queue.is_lock_held(posted.lock_handle_id).await);

    // A second start is refused.
    assert!(!token.try_set_started(LEASE).await.unwrap());

    let mut events = token.subscribe();
    let recorded = token
        .try_set_result(TaskExecutionResult::succeeded(Duration::from_millis(40)))
        .await
        .unwrap();
    assert!(recorded);
    assert_eq!(token.state(), TokenState::Completed);
    assert!(!token.is_locked());
    assert_eq!(events.recv().await.unwrap(), TokenEvent::Released);

    assert_eq!(queue.task_status(posted.id).await, None);
    assert!(!queue.is_lock_held(posted.lock_handle_id).await);

    let result = h.info.get_result(posted.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Processed);
    assert_eq!(result.processing_time_ms, 40);
    assert!(result.processing_finalized_at_ts.is_some());

    // Only the first report counts.
    assert!(!token
        .try_set_result(TaskExecutionResult::succeeded(Duration::ZERO))
        .await
        .unwrap());

    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_result_timestamps_come_from_time_provider() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;
    let instant = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
    let consumer = QueueConsumer::with_time_provider(
        queue.database(),
        queue.config(),
        h.result_queue.clone(),
        Arc::new(FixedTimeProvider(instant)),
    );

    let posted = h
        .producer
        .enqueue(NewTask::new("stamp", json!({})))
        .await
        .unwrap();
    let token = consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());
    assert!(token
        .try_set_result(TaskExecutionResult::succeeded(Duration::from_millis(5)))
        .await
        .unwrap());

    let result = h.info.get_result(posted.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Processed);
    assert_eq!(result.processing_finalized_at_ts, Some(instant));

    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_unwritten_result_keeps_task_row() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("archive", json!({})))
        .await
        .unwrap();
    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());

    // Nothing can write results any more.
    h.result_queue.stop().await.unwrap();
    let mut events = token.subscribe();
    let err = token
        .try_set_result(TaskExecutionResult::succeeded(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, beltline::QueueError::NotRunning { .. }));

    // The lock is gone but the task survives for a later attempt.
    assert_eq!(events.recv().await.unwrap(), TokenEvent::Released);
    assert_eq!(token.state(), TokenState::Cancelled);
    assert!(!token.is_locked());
    assert!(!queue.is_lock_held(posted.lock_handle_id).await);
    assert_eq!(
        queue.task_status(posted.id).await,
        Some(TaskStatus::Processing.as_i16())
    );
    let result = h.info.get_result(posted.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Processing);
    assert_eq!(h.consumer.live_lease_count(), 0);

    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_failures_escalate_to_fatal() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("flaky", json!({})))
        .await
        .unwrap();

    // Threshold is 2 in the test config: Error, Faulted, then Fatal.
    let expected = [TaskStatus::Error, TaskStatus::Faulted, TaskStatus::Fatal];
    for (round, expected_status) in expected.into_iter().enumerate() {
        let token = h
            .consumer
            .dequeue(later(), &[])
            .await
            .unwrap()
            .expect("Task should be eligible for another attempt");
        assert_eq!(token.id(), posted.id);
        assert_eq!(token.result().error_count, round as i32);

        assert!(token.try_set_started(LEASE).await.unwrap());
        let retry_at = 100 * (round as i64 + 1);
        assert!(token
            .try_set_result(TaskExecutionResult::failed(
                QueuedTaskError::new("Timeout", "upstream did not answer"),
                true,
                Duration::from_millis(5),
                retry_at,
            ))
            .await
            .unwrap());

        let result = h.info.get_result(posted.id).await.unwrap().unwrap();
        assert_eq!(result.status, expected_status);
        assert_eq!(result.error_count, round as i32 + 1);
        assert_eq!(
            result.last_error.as_ref().map(|e| e.error_type.as_str()),
            Some("Timeout")
        );

        if expected_status.is_terminal() {
            assert_eq!(queue.task_status(posted.id).await, None);
        } else {
            assert_eq!(
                queue.task_status(posted.id).await,
                Some(expected_status.as_i16())
            );
            // Not eligible until the retry tick has passed.
            assert!(h
                .consumer
                .dequeue(AbstractTimestamp::new(retry_at, 1), &[])
                .await
                .unwrap()
                .is_none());
        }
    }

    assert!(h.consumer.dequeue(later(), &[]).await.unwrap().is_none());
    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_non_recoverable_failure_is_fatal_at_once() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("parse", json!({ "raw": "???" })))
        .await
        .unwrap();

    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());
    token
        .try_set_result(TaskExecutionResult::failed(
            QueuedTaskError::new("ParseError", "not a number"),
            false,
            Duration::from_millis(1),
            0,
        ))
        .await
        .unwrap();

    let result = h.info.get_result(posted.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Fatal);
    assert_eq!(result.error_count, 1);
    assert!(!result.last_error_is_recoverable);
    assert_eq!(queue.task_status(posted.id).await, None);

    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_release_is_idempotent_and_frees_the_lock() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("abandon", json!({})))
        .await
        .unwrap();
    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());

    let mut events = token.subscribe();
    token.release_lock().await;
    token.release_lock().await;

    assert_eq!(token.state(), TokenState::Cancelled);
    assert!(token.cancellation().is_cancelled());
    assert_eq!(events.recv().await.unwrap(), TokenEvent::Released);
    assert!(events.try_recv().is_err());
    assert!(!queue.is_lock_held(posted.lock_handle_id).await);
    assert_eq!(h.consumer.live_lease_count(), 0);

    // A released token can neither start nor report.
    assert!(!token.try_set_started(LEASE).await.unwrap());
    assert!(!token
        .try_set_result(TaskExecutionResult::succeeded(Duration::ZERO))
        .await
        .unwrap());

    // Processing rows whose lease has lapsed are picked up again.
    let again = h
        .consumer
        .dequeue(later().add_ticks(1_000_000), &[])
        .await
        .unwrap()
        .expect("Abandoned task should be dequeued again");
    assert_eq!(again.id(), posted.id);
    again.release_lock().await;

    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_watchdog_relocks_after_connection_loss() {
    let Some(queue) = test_queue_with(|b| {
        b.connect_retry_count(5)
            .connect_retry_delay(Duration::from_millis(100))
    })
    .await
    else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("long_running", json!({})))
        .await
        .unwrap();
    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());

    let original_pid = queue
        .lock_holder_pid(posted.lock_handle_id)
        .await
        .expect("Token should hold its lock");

    let mut events = token.subscribe();
    queue.terminate_backend(original_pid).await;

    let new_pid = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(TokenEvent::ConnectionEstablished { backend_pid }) => return backend_pid,
                Ok(TokenEvent::ConnectionFailedPermanently { reason }) => {
                    panic!("Lock was lost: {}", reason)
                }
                Ok(_) => continue,
                Err(e) => panic!("Token events closed: {}", e),
            }
        }
    })
    .await
    .expect("Token did not reconnect in time");

    assert_ne!(new_pid, original_pid);
    assert_eq!(token.state(), TokenState::Active);
    assert!(!token.cancellation().is_cancelled());
    assert_eq!(
        queue.lock_holder_pid(posted.lock_handle_id).await,
        Some(new_pid)
    );
    assert!(token.connection_stats().connect_count() >= 1);

    // The replacement connection carries the rest of the lease.
    assert!(token
        .try_set_result(TaskExecutionResult::succeeded(Duration::from_millis(3)))
        .await
        .unwrap());
    assert!(!queue.is_lock_held(posted.lock_handle_id).await);

    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_lock_lost_to_another_session_cancels_the_token() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let h = harness(&queue).await;

    let posted = h
        .producer
        .enqueue(NewTask::new("contended", json!({})))
        .await
        .unwrap();
    let token = h.consumer.dequeue(later(), &[]).await.unwrap().unwrap();
    assert!(token.try_set_started(LEASE).await.unwrap());

    let original_pid = queue
        .lock_holder_pid(posted.lock_handle_id)
        .await
        .unwrap();

    // Another session grabs the lock the moment it is freed.
    let thief = queue.database().connect_dedicated().await.unwrap();
    let mut events = token.subscribe();
    queue.terminate_backend(original_pid).await;

    let mut stolen = false;
    for _ in 0..50 {
        let granted: bool = thief
            .client()
            .query_one("SELECT pg_try_advisory_lock($1)", &[&posted.lock_handle_id])
            .await
            .unwrap()
            .get(0);
        if granted {
            stolen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if !stolen {
        // The watchdog won the race; nothing to observe here.
        token.release_lock().await;
        h.result_queue.stop().await.unwrap();
        queue.teardown().await;
        return;
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(TokenEvent::ConnectionFailedPermanently { .. }) => return,
                Ok(_) => continue,
                Err(e) => panic!("Token events closed: {}", e),
            }
        }
    })
    .await
    .expect("Token did not give up the lease");

    assert_eq!(token.state(), TokenState::Cancelled);
    assert!(token.cancellation().is_cancelled());
    assert!(!token.is_locked());

    drop(thief);
    h.result_queue.stop().await.unwrap();
    queue.teardown().await;
}
