// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded runnable queues with work-stealing support.
//!
//! Each virtual core owns one [`Queue`]; the owning worker pushes and pops at
//! the front while at most one [`Stealer`] at a time drains items from the
//! back. Exclusivity is granted through [`Queue::try_steal`] which fails with
//! [`TryStealError::Busy`] while another stealer is active, so an item can
//! never be handed to two workers.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum TryStealError {
    /// Items could not be stolen because the targeted queue already has a
    /// consumer.
    Busy,
    /// No items were available to steal.
    Empty,
}

impl fmt::Display for TryStealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryStealError::Busy => f.write_str("queue already has an active stealer"),
            TryStealError::Empty => f.write_str("queue is empty"),
        }
    }
}

impl std::error::Error for TryStealError {}

/// The queue was full; the rejected item is handed back to the caller.
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Full(..)")
    }
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    stealing: bool,
}

/// A bounded FIFO queue owned by one consumer and stolen from by at most one
/// other at a time.
///
/// A capacity of zero means unbounded; this is used by the global queue,
/// which must always be able to absorb overflow from the local ones.
#[derive(Debug)]
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

// === impl Queue ===

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stealing: false,
            }),
            capacity,
        }
    }

    /// Append an item at the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] holding the rejected item when the queue is at
    /// capacity, so the caller can route it to an overflow queue.
    pub fn push(&self, item: T) -> Result<(), Full<T>> {
        let mut inner = self.inner.lock().unwrap();

        if self.capacity != 0 && inner.items.len() >= self.capacity {
            return Err(Full(item));
        }

        inner.items.push_back(item);
        Ok(())
    }

    /// Remove the item at the front of the queue.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attempt to steal from this queue. The returned [`Stealer`] grants
    /// exclusive steal access until it is dropped.
    ///
    /// # Errors
    ///
    /// Fails when the queue is *empty*, holds fewer than `min` items, or
    /// *already has an active stealer*.
    pub fn try_steal(&self, min: usize) -> Result<Stealer<'_, T>, TryStealError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.stealing {
            return Err(TryStealError::Busy);
        }

        let Some(snapshot) = NonZeroUsize::new(inner.items.len()) else {
            return Err(TryStealError::Empty);
        };

        if snapshot.get() < min {
            return Err(TryStealError::Empty);
        }

        inner.stealing = true;

        Ok(Stealer {
            queue: self,
            snapshot,
        })
    }
}

/// Exclusive steal access to a [`Queue`], released on drop.
pub struct Stealer<'q, T> {
    queue: &'q Queue<T>,
    /// The queue length observed when this `Stealer` was created.
    snapshot: NonZeroUsize,
}

// === impl Stealer ===

impl<T> Stealer<'_, T> {
    pub fn initial_count(&self) -> NonZeroUsize {
        self.snapshot
    }

    /// Steal a single item from the back of the queue.
    pub fn take_one(&self) -> Option<T> {
        self.queue.inner.lock().unwrap().items.pop_back()
    }

    /// Steal half the items observed at creation time, moving all but the
    /// first into `dest` and returning the first for immediate execution.
    ///
    /// Items that do not fit into `dest` stay in the source queue.
    pub fn take_half(&self, dest: &Queue<T>) -> Option<T> {
        let max = self.snapshot.get().div_ceil(2);

        let first = self.take_one()?;

        let mut moved = 0;
        for _ in 1..max {
            let Some(item) = self.take_one() else { break };

            if let Err(Full(item)) = dest.push(item) {
                // hand it back rather than dropping work on the floor
                self.queue.inner.lock().unwrap().items.push_back(item);
                break;
            }

            moved += 1;
        }

        tracing::trace!(moved, "stole {} item(s)", moved + 1);

        Some(first)
    }
}

impl<T> Drop for Stealer<'_, T> {
    fn drop(&mut self) {
        self.queue.inner.lock().unwrap().stealing = false;
    }
}

impl<T> fmt::Debug for Stealer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = Queue::new(4);

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_full_hands_item_back() {
        let queue = Queue::new(2);

        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let Full(rejected) = queue.push(3).unwrap_err();
        assert_eq!(rejected, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn unbounded_queue_never_rejects() {
        let queue = Queue::new(0);

        for i in 0..1024 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.len(), 1024);
    }

    #[test]
    fn steal_requires_min_items() {
        let queue = Queue::<u32>::new(8);
        queue.push(1).unwrap();

        assert_eq!(queue.try_steal(2).unwrap_err(), TryStealError::Empty);
        assert!(queue.try_steal(1).is_ok());
    }

    #[test]
    fn only_one_stealer_at_a_time() {
        let queue = Queue::new(8);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let stealer = queue.try_steal(1).unwrap();
        assert_eq!(queue.try_steal(1).unwrap_err(), TryStealError::Busy);

        drop(stealer);
        assert!(queue.try_steal(1).is_ok());
    }

    #[test]
    fn take_half_moves_half() {
        let src = Queue::new(8);
        let dest = Queue::new(8);

        for i in 0..6 {
            src.push(i).unwrap();
        }

        let stealer = src.try_steal(2).unwrap();
        let first = stealer.take_half(&dest).unwrap();
        drop(stealer);

        // 6 observed -> 3 stolen: one returned, two moved
        assert_eq!(first, 5);
        assert_eq!(dest.len(), 2);
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn steal_never_duplicates() {
        use std::sync::Arc;

        let src = Arc::new(Queue::new(0));
        let dest = Arc::new(Queue::new(0));

        for i in 0..1000u32 {
            src.push(i).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let src = Arc::clone(&src);
            let dest = Arc::clone(&dest);

            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match src.try_steal(1) {
                        Ok(stealer) => {
                            if let Some(item) = stealer.take_half(&dest) {
                                seen.push(item);
                            }
                        }
                        Err(TryStealError::Busy) => continue,
                        Err(TryStealError::Empty) => break,
                    }
                }
                seen
            }));
        }

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        while let Some(item) = dest.pop() {
            all.push(item);
        }
        while let Some(item) = src.pop() {
            all.push(item);
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
