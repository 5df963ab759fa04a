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

use std::time::Duration;

use beltline::{ListenerEvent, NewTask, NotificationListener, QueueProducer};
use serde_json::json;
use serial_test::serial;
use tokio::sync::broadcast;

use crate::fixtures::test_queue;

/// Waits for the first event `matches` accepts, skipping timeouts and
/// anything else.
async fn wait_for<T>(
    events: &mut broadcast::Receiver<ListenerEvent>,
    mut matches: impl FnMut(ListenerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = matches(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("Listener events closed: {}", e),
            }
        }
    })
    .await
    .expect("Timed out waiting for listener event")
}

#[tokio::test]
#[serial]
async fn test_listener_reports_posted_tasks() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let listener = NotificationListener::new(queue.database(), queue.config());
    let mut events = listener.subscribe();

    assert!(listener.start().await.unwrap());
    assert!(listener.is_running());
    let pid = wait_for(&mut events, |e| match e {
        ListenerEvent::Connected { backend_pid } => Some(backend_pid),
        _ => None,
    })
    .await;
    assert_eq!(listener.diagnostics().backend_pid, pid);

    let producer = QueueProducer::new(queue.database(), queue.config());
    let task = producer
        .enqueue(NewTask::new("announce", json!({})).with_priority(3))
        .await
        .unwrap();

    let payload = wait_for(&mut events, |e| match e {
        ListenerEvent::NewTaskPosted { payload } => Some(payload),
        _ => None,
    })
    .await;
    let body: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(body["id"], json!(task.id.to_string()));
    assert_eq!(body["task_type"], json!("announce"));
    assert_eq!(body["priority"], json!(3));
    assert!(listener.diagnostics().notification_count >= 1);

    assert!(listener.stop().await.unwrap());
    assert!(!listener.is_running());
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_listener_times_out_while_idle() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let listener = NotificationListener::new(queue.database(), queue.config());
    let mut events = listener.subscribe();
    listener.start().await.unwrap();

    wait_for(&mut events, |e| {
        (e == ListenerEvent::TimedOutWhileWaiting).then_some(())
    })
    .await;
    assert!(listener.diagnostics().wait_timeout_count >= 1);

    listener.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_listener_restores_subscription_after_connection_loss() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let listener = NotificationListener::new(queue.database(), queue.config());
    let mut events = listener.subscribe();
    listener.start().await.unwrap();

    let first_pid = wait_for(&mut events, |e| match e {
        ListenerEvent::Connected { backend_pid } => Some(backend_pid),
        _ => None,
    })
    .await;

    queue.terminate_backend(first_pid).await;

    let restored_pid = wait_for(&mut events, |e| match e {
        ListenerEvent::ConnectionRestored { backend_pid } => Some(backend_pid),
        _ => None,
    })
    .await;
    assert_ne!(restored_pid, first_pid);
    assert!(listener.diagnostics().reconnect_count >= 1);

    // The new subscription still hears producers.
    let producer = QueueProducer::new(queue.database(), queue.config());
    let task = producer
        .enqueue(NewTask::new("after_reconnect", json!({})))
        .await
        .unwrap();
    let expected_id = task.id.to_string();
    wait_for(&mut events, |e| match e {
        ListenerEvent::NewTaskPosted { payload } if payload.contains(&expected_id) => Some(()),
        _ => None,
    })
    .await;

    listener.stop().await.unwrap();
    queue.teardown().await;
}
