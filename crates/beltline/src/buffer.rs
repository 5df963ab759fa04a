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

//! Bounded hand-off between the poller and the workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO that can be closed for adding.
///
/// Once [`complete_adding`](TaskBuffer::complete_adding) has been called,
/// puts are refused and [`take`](TaskBuffer::take) drains what is left
/// before returning `None`.
#[derive(Debug)]
pub struct TaskBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    adding_completed: AtomicBool,
    item_added: Notify,
    item_taken: Notify,
}

impl<T> TaskBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            adding_completed: AtomicBool::new(false),
            item_added: Notify::new(),
            item_taken: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    pub fn is_adding_completed(&self) -> bool {
        self.adding_completed.load(Ordering::Acquire)
    }

    /// Adding is completed and every item has been taken.
    pub fn is_completed(&self) -> bool {
        self.is_adding_completed() && self.items.lock().is_empty()
    }

    /// Adds `item` if there is room. Gives the item back otherwise.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        if self.is_adding_completed() {
            return Err(item);
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.item_added.notify_one();
        Ok(())
    }

    /// Adds `item`, waiting for room. Gives the item back if adding gets
    /// completed first.
    pub async fn put(&self, mut item: T) -> Result<(), T> {
        loop {
            let room = self.item_taken.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(returned) if self.is_adding_completed() => return Err(returned),
                Err(returned) => item = returned,
            }
            room.await;
        }
    }

    /// Takes the oldest item, waiting for one. `None` once completed.
    pub async fn take(&self) -> Option<T> {
        loop {
            let added = self.item_added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            if let Some(item) = self.items.lock().pop_front() {
                self.item_taken.notify_one();
                return Some(item);
            }
            if self.is_adding_completed() {
                return None;
            }
            added.await;
        }
    }

    /// Refuses further puts and wakes everyone waiting.
    pub fn complete_adding(&self) {
        self.adding_completed.store(true, Ordering::Release);
        self.item_added.notify_waiters();
        self.item_taken.notify_waiters();
    }

    /// Removes and returns everything still buffered.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        if !drained.is_empty() {
            self.item_taken.notify_waiters();
        }
        drained
    }
}
