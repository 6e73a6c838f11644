//! Fixed-capacity FIFO used as the only hand-off point between threads
//!
//! Producers and consumers share one mutex-guarded ring buffer. Blocking
//! operations park on a condition variable instead of polling: `add` waits
//! on `not_full`, `take` waits on `not_empty`, and each successful operation
//! wakes one waiter on the opposite side. Items are moved in and out, never
//! copied.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Returned by a non-blocking `add` on a full queue, handing the item back
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue is full")]
pub struct QueueFull<T>(pub T);

/// Returned by a non-blocking `take` on an empty queue
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("queue is empty")]
pub struct QueueEmpty;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    // A panicking holder cannot leave the deque half-updated, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`.
    ///
    /// When the queue is full, blocks until space frees up if `block` is
    /// set, otherwise returns the item untouched inside [`QueueFull`].
    pub fn add(&self, item: T, block: bool) -> Result<(), QueueFull<T>> {
        let mut items = self.lock();
        if items.len() == self.capacity {
            if !block {
                return Err(QueueFull(item));
            }
            items = self
                .not_full
                .wait_while(items, |items| items.len() == self.capacity)
                .unwrap_or_else(PoisonError::into_inner);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item.
    ///
    /// When the queue is empty, blocks until an item arrives if `block` is
    /// set, otherwise returns [`QueueEmpty`].
    pub fn take(&self, block: bool) -> Result<T, QueueEmpty> {
        let mut items = self.lock();
        if items.is_empty() {
            if !block {
                return Err(QueueEmpty);
            }
            items = self
                .not_empty
                .wait_while(items, |items| items.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
        }
        let item = items.pop_front().ok_or(QueueEmpty)?;
        drop(items);
        self.not_full.notify_one();
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
