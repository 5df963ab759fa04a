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

//! The shared clock against a live server.

use std::sync::Arc;
use std::time::Duration;

use beltline::{AbstractTimestamp, TimingBelt};
use serial_test::serial;

use crate::fixtures::test_queue;

#[tokio::test]
#[serial]
async fn test_belt_starts_from_initial_cost_and_accumulates() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let belt = TimingBelt::new(queue.database(), queue.config());
    belt.start().await.unwrap();

    let initial = queue.config().initial_wallclock_cost_ms();
    assert_eq!(
        belt.current_time().await.unwrap(),
        AbstractTimestamp::new(0, initial)
    );

    belt.add_wallclock_cost(Duration::from_millis(250));
    let first = belt.tick().await.unwrap();
    assert_eq!(first, AbstractTimestamp::new(1, initial + 250));
    assert_eq!(belt.wallclock_cost_since_last_tick(), 0);
    assert_eq!(belt.last_known_time(), first);

    let second = belt.tick().await.unwrap();
    assert_eq!(second, AbstractTimestamp::new(2, initial + 250));

    belt.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_belts_sharing_a_time_row_agree() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let a = Arc::new(TimingBelt::new(queue.database(), queue.config()));
    let b = Arc::new(TimingBelt::new(queue.database(), queue.config()));
    a.start().await.unwrap();
    b.start().await.unwrap();

    const TICKS_EACH: usize = 10;
    let mut handles = Vec::new();
    for belt in [a.clone(), b.clone()] {
        for _ in 0..TICKS_EACH {
            let belt = belt.clone();
            handles.push(tokio::spawn(async move { belt.tick().await }));
        }
    }

    let mut highest = 0;
    for handle in handles {
        let ts = handle.await.unwrap().unwrap();
        assert!(ts.ticks() >= 1);
        highest = highest.max(ts.ticks());
    }

    // Batched requests share a timestamp but each still counts as a tick.
    let now = a.current_time().await.unwrap();
    assert_eq!(now.ticks(), (2 * TICKS_EACH) as i64);
    assert_eq!(highest, now.ticks());
    assert_eq!(b.current_time().await.unwrap(), now);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    queue.teardown().await;
}

#[tokio::test]
#[serial]
async fn test_ticks_after_delay_use_the_shared_rate() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let belt = TimingBelt::new(queue.database(), queue.config());
    belt.start().await.unwrap();

    // Ten ticks over the initial second: 100 ms per tick.
    for _ in 0..10 {
        belt.tick().await.unwrap();
    }
    let now = belt.current_time().await.unwrap();
    assert_eq!(now.ticks(), 10);
    assert_eq!(now.tick_duration(), 100);

    assert_eq!(
        belt.compute_ticks_after(Duration::from_millis(550)).await.unwrap(),
        16
    );
    assert_eq!(belt.compute_absolute_ticks(5).await.unwrap(), 15);

    belt.stop().await.unwrap();
    queue.teardown().await;
}
